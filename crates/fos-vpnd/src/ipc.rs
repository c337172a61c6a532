//! Host message socket
//!
//! One request per connection: the client writes an encoded `HostMessage`,
//! shuts down its write half and reads back an encoded `HostResponse`.

use fos_vpn::{HostMessage, HostMessageError, HostResponse, SessionError, SessionHandle};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Upper bound for a single request
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Decode(#[from] HostMessageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Bind the socket, replacing a stale one, readable by the owner only
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
    }
    if path.exists() {
        fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Accept connections until the task is aborted
pub async fn serve(listener: UnixListener, session: SessionHandle) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Accepting host message connection failed: {}", e);
                continue;
            }
        };

        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &session).await {
                warn!("Host message failed: {}", e);
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, session: &SessionHandle) -> Result<(), IpcError> {
    let mut request = Vec::new();
    (&mut stream).take(MAX_REQUEST_BYTES).read_to_end(&mut request).await?;

    let message = match HostMessage::decode(&request) {
        Ok(message) => message,
        Err(e) => {
            stream.write_all(&HostResponse::none().encode()).await?;
            return Err(e.into());
        }
    };

    debug!("Host message: {:?}", message);
    let response = session.handle_host_message(message).await?;

    stream.write_all(&response.encode()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Send one message to a running daemon
pub async fn send(path: &Path, message: &HostMessage) -> Result<HostResponse, IpcError> {
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(&message.encode()).await?;
    stream.shutdown().await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(HostResponse::decode(&response)?)
}
