//! Server assignment — the proxy's answer to "which worker serves my zone".

use serde::{Deserialize, Serialize};

use crate::ids::WorkerId;

/// Immutable answer to one assignment request. Not cached by clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAssignment {
    pub worker: WorkerId,
    pub address: String,
    pub port: u16,
}

impl ServerAssignment {
    /// `address:port`, the key workers are registered under in the directory.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
