//! Host Messages
//!
//! Request/response pairs the host application sends to a running session.
//! A request is one type byte followed by an optional payload. A response
//! is a presence byte (0 = nothing, 1 = payload follows) and the payload.

use std::time::Duration;

/// Host request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    /// Rotate the key now
    ExpireRegistrationKey,
    GetLastErrorMessage,
    GetRuntimeConfiguration,
    IsHavingConnectivityIssues,
    /// `None` selects automatically
    SetSelectedServer(Option<String>),
    GetServerLocation,
    GetServerAddress,
    /// `None` restores the default validity
    SetKeyValidity(Option<Duration>),
    ResetAllState,
}

impl HostMessage {
    pub fn type_byte(&self) -> u8 {
        match self {
            HostMessage::ExpireRegistrationKey => 0,
            HostMessage::GetLastErrorMessage => 1,
            HostMessage::GetRuntimeConfiguration => 2,
            HostMessage::IsHavingConnectivityIssues => 3,
            HostMessage::SetSelectedServer(_) => 4,
            HostMessage::GetServerLocation => 5,
            HostMessage::GetServerAddress => 6,
            HostMessage::SetKeyValidity(_) => 7,
            HostMessage::ResetAllState => 8,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HostMessageError> {
        let (&kind, payload) = bytes.split_first().ok_or(HostMessageError::Empty)?;

        let message = match kind {
            0 => HostMessage::ExpireRegistrationKey,
            1 => HostMessage::GetLastErrorMessage,
            2 => HostMessage::GetRuntimeConfiguration,
            3 => HostMessage::IsHavingConnectivityIssues,
            // Undecodable names fall back to automatic selection
            4 => HostMessage::SetSelectedServer(
                std::str::from_utf8(payload)
                    .ok()
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            ),
            5 => HostMessage::GetServerLocation,
            6 => HostMessage::GetServerAddress,
            7 => {
                if payload.is_empty() {
                    HostMessage::SetKeyValidity(None)
                } else {
                    let seconds: [u8; 8] = payload
                        .try_into()
                        .map_err(|_| HostMessageError::InvalidPayload(kind))?;
                    HostMessage::SetKeyValidity(Some(Duration::from_secs(u64::from_le_bytes(seconds))))
                }
            }
            8 => HostMessage::ResetAllState,
            other => return Err(HostMessageError::UnknownType(other)),
        };

        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![self.type_byte()];

        match self {
            HostMessage::SetSelectedServer(Some(name)) => bytes.extend_from_slice(name.as_bytes()),
            HostMessage::SetKeyValidity(Some(validity)) => {
                bytes.extend_from_slice(&validity.as_secs().to_le_bytes())
            }
            _ => {}
        }

        bytes
    }
}

/// Host response payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostResponse(Option<Vec<u8>>);

impl HostResponse {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn text(text: Option<String>) -> Self {
        Self(text.map(String::into_bytes))
    }

    pub fn flag(value: bool) -> Self {
        Self(Some(vec![u8::from(value)]))
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    pub fn as_text(&self) -> Option<&str> {
        self.payload().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self.0 {
            None => vec![0],
            Some(ref payload) => {
                let mut bytes = Vec::with_capacity(payload.len() + 1);
                bytes.push(1);
                bytes.extend_from_slice(payload);
                bytes
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HostMessageError> {
        match bytes.split_first() {
            Some((0, [])) => Ok(Self(None)),
            Some((1, payload)) => Ok(Self(Some(payload.to_vec()))),
            Some(_) => Err(HostMessageError::InvalidResponse),
            None => Err(HostMessageError::Empty),
        }
    }
}

/// Host message framing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostMessageError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Invalid payload for message type {0}")]
    InvalidPayload(u8),

    #[error("Invalid response framing")]
    InvalidResponse,
}
