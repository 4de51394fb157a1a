//! Shared application state.

use crate::sandbox::Sandbox;

/// Shared application state. The sandbox configuration inside is read-only;
/// nothing about one submission is visible to another.
#[derive(Clone)]
pub struct AppState {
    pub sandbox: Sandbox,
}

impl AppState {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}
