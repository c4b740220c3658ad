use crate::api::AppState;
use anyhow::Result;

/// Entry point for running the plugin either as a standalone HTTP server or
/// via the homecore stdio protocol.
pub async fn run(stdio: bool, state: AppState) -> Result<()> {
    if stdio {
        crate::core_bridge::run_stdio(state).await
    } else {
        let every = state.config.cleanup_interval;
        crate::housekeeping::run_housekeeping(state.clone(), every);
        crate::api::run_http_server(state).await
    }
}
