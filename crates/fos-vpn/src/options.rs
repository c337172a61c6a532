//! Start Options
//!
//! Options handed to a session start as a flat string map, the way the
//! host passes them along with the activation request.

use crate::device_manager::ServerSelectionMethod;
use crate::secret_store::AuthToken;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::warn;

pub const OPTION_SELECTED_SERVER: &str = "selectedServer";
pub const OPTION_AUTH_TOKEN: &str = "authToken";
pub const OPTION_KEY_VALIDITY: &str = "keyValidity";
pub const OPTION_IS_ON_DEMAND: &str = "is-on-demand";
pub const OPTION_ACTIVATION_ATTEMPT_ID: &str = "activationAttemptId";
pub const OPTION_TUNNEL_FAILURE_SIMULATION: &str = "tunnelFailureSimulation";

/// User server preference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectedServer {
    #[default]
    Automatic,
    Endpoint(String),
}

impl SelectedServer {
    pub fn name(&self) -> Option<&str> {
        match self {
            SelectedServer::Automatic => None,
            SelectedServer::Endpoint(name) => Some(name),
        }
    }

    pub fn selection_method(&self) -> ServerSelectionMethod {
        match self {
            SelectedServer::Automatic => ServerSelectionMethod::Automatic,
            SelectedServer::Endpoint(name) => ServerSelectionMethod::PreferredServer(name.clone()),
        }
    }
}

/// Who asked for the tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Activation {
    /// The host application
    #[default]
    App,
    /// The system on-demand rule
    OnDemand,
    /// System settings, outside the host application
    SystemSettings,
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::App => write!(f, "app"),
            Activation::OnDemand => write!(f, "on-demand"),
            Activation::SystemSettings => write!(f, "settings"),
        }
    }
}

/// Parsed start options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub selected_server: Option<SelectedServer>,
    pub auth_token: Option<AuthToken>,
    pub key_validity: Option<Duration>,
    pub activation: Activation,
    pub simulate_failure: bool,
}

impl StartOptions {
    /// Parse the host's option map
    ///
    /// Unparseable values are ignored. Without an activation attempt id or
    /// the on-demand flag the start came from system settings.
    pub fn from_map(options: &HashMap<String, String>) -> Self {
        let is_on_demand = options
            .get(OPTION_IS_ON_DEMAND)
            .is_some_and(|value| value == "true" || value == "1");

        let activation = if is_on_demand {
            Activation::OnDemand
        } else if options.contains_key(OPTION_ACTIVATION_ATTEMPT_ID) {
            Activation::App
        } else {
            Activation::SystemSettings
        };

        let key_validity = options.get(OPTION_KEY_VALIDITY).and_then(|value| {
            match value.trim().parse::<f64>() {
                Ok(seconds) if seconds.is_finite() && seconds > 0.0 => {
                    Some(Duration::from_secs_f64(seconds))
                }
                _ => {
                    warn!("Ignoring invalid key validity option {:?}", value);
                    None
                }
            }
        });

        Self {
            selected_server: options
                .get(OPTION_SELECTED_SERVER)
                .map(|name| SelectedServer::Endpoint(name.clone())),
            auth_token: options
                .get(OPTION_AUTH_TOKEN)
                .filter(|token| !token.is_empty())
                .map(|token| AuthToken::new(token.clone())),
            key_validity,
            activation,
            simulate_failure: options
                .get(OPTION_TUNNEL_FAILURE_SIMULATION)
                .is_some_and(|value| value == "true"),
        }
    }
}
