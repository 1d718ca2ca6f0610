use std::sync::Arc;

use plinth_host::PluginHost;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<PluginHost>,
}

impl AppState {
    pub fn new(host: Arc<PluginHost>) -> Self {
        Self { host }
    }
}
