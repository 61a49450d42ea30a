//! Request handlers for reading and replacing the network configuration
//!
//! Transport agnostic: the CLI calls these directly, and any outer surface
//! serializes the responses as they are.

use crate::error::ErrorDescriptor;
use crate::manager::ConfigManager;
use crate::netconfig::NetworkConfiguration;
use serde::Serialize;

/// Outcome of a configuration change request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetConfigResponse {
    /// Empty when the candidate was applied and saved
    pub errors: Vec<ErrorDescriptor>,
}

impl SetConfigResponse {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Currently active configuration, if one was ever saved
pub async fn get_active(manager: &ConfigManager) -> Option<NetworkConfiguration> {
    manager.get_active_config().await
}

/// Validate, apply and persist a candidate configuration
///
/// The candidate is persisted only after it has been fully applied. Any
/// validation or apply error leaves the saved configuration untouched.
pub async fn set_config(manager: &ConfigManager, candidate: NetworkConfiguration) -> SetConfigResponse {
    let errors = manager.validate_config(&candidate);
    if !errors.is_empty() {
        return SetConfigResponse { errors };
    }

    let errors = manager.try_apply_config(&candidate).await;
    if !errors.is_empty() {
        return SetConfigResponse { errors };
    }

    if let Err(e) = manager.save_config(&candidate).await {
        tracing::error!(error = %e, "Applied configuration could not be saved");
        return SetConfigResponse {
            errors: vec![e.into()],
        };
    }

    SetConfigResponse::default()
}
