//! Shared server state

use std::sync::Arc;

use pelbox_core::CommandGateway;

/// Shared application state
pub struct AppState {
    /// Session check, sequencing and persistence for member commands
    pub gateway: CommandGateway,
}

impl AppState {
    pub fn new(gateway: CommandGateway) -> Self {
        Self { gateway }
    }
}

pub type SharedState = Arc<AppState>;
