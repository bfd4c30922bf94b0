//! HTTP server command for `preview-manager serve`.

use anyhow::Result;

use preview_manager::config::Settings;
use preview_manager::preview::server;

pub async fn cmd_serve(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    if let Some(host) = host {
        settings.host = host;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    if dev {
        settings.dev_mode = true;
    }
    settings.warn_missing_credentials();
    server::start_server(settings).await
}
