//! fOS VPN daemon
//!
//! Brings the tunnel up, keeps the session running until a signal arrives
//! or the session gives up, and answers host messages on a Unix socket.
//! The same binary doubles as the host message client.

mod ipc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fos_vpn::{
    Activation, ConnectionStatus, DeviceManager, ErrorEvents, FileSecretStore, HostMessage, HttpClient, HttpDirectoryClient,
    KeyStore, NoopPlatform, SecretStore, SelectedServer, ServerListCache, SessionEvent, SessionHandle, SessionParts,
    Settings, StartOptions, StopReason, TcpConnectivityProbe, TcpLatencyProbe, TokenStore, TunnelSessionController,
    WgQuickAdapter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_CONFIG: &str = "/etc/fos-vpn/fos-vpn.toml";

#[derive(Debug, Parser)]
#[command(name = "fos-vpnd", version, about = "fOS WireGuard VPN daemon")]
struct Cli {
    /// Settings file; built-in defaults are used when it does not exist
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override the host message socket
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the tunnel up and keep it running (default)
    Run(RunArgs),
    /// Send a host message to a running daemon
    Message {
        #[command(subcommand)]
        message: MessageArg,
    },
}

#[derive(Debug, Default, clap::Args)]
struct RunArgs {
    /// Server name to connect to instead of automatic selection
    #[arg(long)]
    server: Option<String>,

    /// Redeem an invite code before connecting
    #[arg(long)]
    invite_code: Option<String>,

    /// Key lifetime in seconds
    #[arg(long)]
    key_validity: Option<u64>,

    /// Started by an on-demand rule rather than the user
    #[arg(long)]
    on_demand: bool,
}

#[derive(Debug, Subcommand)]
enum MessageArg {
    /// Rotate the registration key now
    ExpireKey,
    LastError,
    RuntimeConfig,
    ConnectivityIssues,
    /// Select a server by name, or automatic selection when omitted
    SelectServer { name: Option<String> },
    ServerLocation,
    ServerAddress,
    /// Key lifetime in seconds, or the default when omitted
    KeyValidity { seconds: Option<u64> },
    ResetAll,
}

impl From<MessageArg> for HostMessage {
    fn from(arg: MessageArg) -> Self {
        match arg {
            MessageArg::ExpireKey => HostMessage::ExpireRegistrationKey,
            MessageArg::LastError => HostMessage::GetLastErrorMessage,
            MessageArg::RuntimeConfig => HostMessage::GetRuntimeConfiguration,
            MessageArg::ConnectivityIssues => HostMessage::IsHavingConnectivityIssues,
            MessageArg::SelectServer { name } => HostMessage::SetSelectedServer(name),
            MessageArg::ServerLocation => HostMessage::GetServerLocation,
            MessageArg::ServerAddress => HostMessage::GetServerAddress,
            MessageArg::KeyValidity { seconds } => HostMessage::SetKeyValidity(seconds.map(Duration::from_secs)),
            MessageArg::ResetAll => HostMessage::ResetAllState,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings(&cli.config)?;
    if let Some(socket) = cli.socket {
        settings.socket_path = socket;
    }

    match cli.command {
        Some(Command::Message { message }) => send_message(&settings, message).await,
        Some(Command::Run(args)) => run(settings, args).await,
        None => run(settings, RunArgs::default()).await,
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!("{} not found, using default settings", path.display());
        return Ok(Settings::default());
    }

    Settings::from_toml_file(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(settings: Settings, args: RunArgs) -> Result<()> {
    info!("fOS VPN starting...");
    info!("Using mimalloc allocator");

    let (error_tx, mut error_rx) = mpsc::unbounded_channel::<fos_vpn::ErrorEvent>();
    tokio::spawn(async move {
        while let Some(event) = error_rx.recv().await {
            debug!(code = event.code, "Backend error: {}", event.message);
        }
    });

    let devices = Arc::new(build_device_manager(&settings, ErrorEvents::new(error_tx))?);

    if let Some(code) = args.invite_code.as_deref() {
        devices.redeem(code).await.context("redeeming invite code")?;
        info!("Invite code redeemed");
    }

    let session = TunnelSessionController::spawn(SessionParts {
        devices,
        adapter: Arc::new(WgQuickAdapter::new(&settings.interface_name, &settings.state_dir)?),
        probe: Arc::new(TcpConnectivityProbe::new(settings.probe_target()?)),
        latency_probe: Arc::new(TcpLatencyProbe::new(settings.latency_port)),
        platform: Arc::new(NoopPlatform),
        config: settings.session_config(),
    });

    let listener = ipc::bind(&settings.socket_path)
        .with_context(|| format!("binding {}", settings.socket_path.display()))?;
    let server = tokio::spawn(ipc::serve(listener, session.clone()));
    info!("Host messages on {}", settings.socket_path.display());

    let result = supervise(&session, start_options(&args)).await;

    if let Err(e) = session.stop(StopReason::Shutdown).await {
        warn!("Stopping the session failed: {}", e);
    }
    server.abort();
    if let Err(e) = std::fs::remove_file(&settings.socket_path) {
        debug!("Could not remove {}: {}", settings.socket_path.display(), e);
    }

    info!("fOS VPN shutting down");
    result
}

fn build_device_manager(settings: &Settings, errors: ErrorEvents) -> Result<DeviceManager> {
    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(settings.key_file()));

    let keys = Arc::new(KeyStore::new(secrets.clone()));
    keys.set_validity_interval(settings.key_validity());

    let directory = HttpDirectoryClient::new(settings.directory_url()?, HttpClient::with_defaults());

    Ok(DeviceManager::new(
        Arc::new(directory),
        TokenStore::new(secrets),
        keys,
        Arc::new(ServerListCache::with_file(settings.server_cache_file())),
        errors,
    )
    .with_defaults(settings.tunnel_defaults()?))
}

fn start_options(args: &RunArgs) -> StartOptions {
    StartOptions {
        selected_server: args.server.clone().map(SelectedServer::Endpoint),
        key_validity: args.key_validity.filter(|&secs| secs > 0).map(Duration::from_secs),
        activation: if args.on_demand {
            Activation::OnDemand
        } else {
            Activation::App
        },
        ..StartOptions::default()
    }
}

/// Start the session and drive it from signals until it ends.
/// SIGUSR1 and SIGUSR2 map to system sleep and wake.
async fn supervise(session: &SessionHandle, options: StartOptions) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut suspend = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;

    let mut events = session.subscribe();
    session.start(options).await.context("starting the tunnel")?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => return Ok(()),
            _ = terminate.recv() => return Ok(()),
            _ = suspend.recv() => session.sleep().await?,
            _ = resume.recv() => session.wake().await?,
            event = events.recv() => match event {
                Ok(SessionEvent::StatusChanged(change)) => {
                    info!("Tunnel {:?}", change.status);
                    if change.status == ConnectionStatus::Disconnected {
                        return session_ended(session).await;
                    }
                }
                Ok(SessionEvent::ServerSelected(server)) => {
                    info!("Using server {} ({})", server.name, server.location);
                }
                Ok(SessionEvent::ConnectivityIssues(issues)) => {
                    if issues {
                        warn!("Tunnel is not passing traffic, looking for another server");
                    }
                }
                Ok(SessionEvent::LatencyReported { server, latency }) => {
                    debug!("Latency to {}: {:?}", server, latency);
                }
                Ok(SessionEvent::RekeyCompleted) => info!("Registration key rotated"),
                Ok(SessionEvent::Error(event)) => warn!(code = event.code, "{}", event.message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!("Missed {} session events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => bail!("session closed unexpectedly"),
            },
        }
    }
}

/// A disconnect without a recorded error is a host reset
async fn session_ended(session: &SessionHandle) -> Result<()> {
    let last_error = session.handle_host_message(HostMessage::GetLastErrorMessage).await?;

    match last_error.as_text() {
        Some(message) => bail!("tunnel stopped: {}", message),
        None => Ok(()),
    }
}

async fn send_message(settings: &Settings, message: MessageArg) -> Result<()> {
    let message = HostMessage::from(message);
    let response = ipc::send(&settings.socket_path, &message)
        .await
        .with_context(|| format!("talking to {}", settings.socket_path.display()))?;

    match (&message, response.payload()) {
        (HostMessage::IsHavingConnectivityIssues, Some([flag])) => println!("{}", *flag != 0),
        (_, Some(_)) => println!("{}", response.as_text().unwrap_or("<binary payload>")),
        (_, None) => {}
    }
    Ok(())
}
