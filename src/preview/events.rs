//! Container runtime event listener.
//!
//! Follows the runtime's event stream, maps state-transition events for
//! preview containers back to their environment, and debounces bursts into
//! a single status refresh. The stream is restarted whenever it ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::compose::match_container;
use super::db::DbHandle;
use super::debounce::Debouncer;
use super::hub::RefreshTrigger;
use super::models::EnvironmentKey;
use super::process::LineStream;
use super::runtime::ContainerRuntime;

/// Event actions that change what `ps` reports.
const STATE_ACTIONS: [&str; 7] = ["start", "stop", "die", "restart", "kill", "pause", "unpause"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: String,
    pub container: String,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Action")]
    action: Option<String>,
    /// Older engines only send `status`.
    status: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: RawActor,
}

#[derive(Debug, Default, Deserialize)]
struct RawActor {
    #[serde(rename = "Attributes", default)]
    attributes: RawAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct RawAttributes {
    #[serde(default)]
    name: String,
}

/// Parse one stream line, keeping only state transitions. Actions such as
/// `exec_start: bash` or `health_status: healthy` are reduced to the part
/// before the colon.
pub fn parse_event(line: &str) -> Option<ContainerEvent> {
    let raw: RawEvent = serde_json::from_str(line.trim()).ok()?;
    let action = raw.action.or(raw.status)?;
    let action = action.split(':').next().unwrap_or_default().trim();
    if !STATE_ACTIONS.contains(&action) || raw.actor.attributes.name.is_empty() {
        return None;
    }
    Some(ContainerEvent {
        action: action.to_string(),
        container: raw.actor.attributes.name,
    })
}

pub struct EventListener {
    runtime: Arc<dyn ContainerRuntime>,
    db: DbHandle,
    refresh: RefreshTrigger,
    debouncer: Debouncer,
    reconnect: Duration,
    prefix_refresh: Duration,
}

impl EventListener {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: DbHandle,
        refresh: RefreshTrigger,
        debounce: Duration,
        reconnect: Duration,
        prefix_refresh: Duration,
    ) -> Self {
        Self {
            runtime,
            db,
            refresh,
            debouncer: Debouncer::new(debounce),
            reconnect,
            prefix_refresh,
        }
    }

    async fn known_environments(&self) -> Result<Vec<EnvironmentKey>> {
        let listings = self.db.call(|db| db.list_environments()).await?;
        Ok(listings.iter().map(|l| l.environment.key()).collect())
    }

    /// Follow the event stream until cancelled, reconnecting after
    /// `reconnect` whenever it ends or cannot be started.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Container event listener started");
        loop {
            match LineStream::spawn(&self.runtime.events()) {
                Ok(stream) => {
                    if self.consume(stream, &cancel).await {
                        break;
                    }
                    tracing::warn!("Container event stream ended");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to start container event stream"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect) => {}
            }
            tracing::info!("Reconnecting container event stream");
        }
        self.debouncer.cancel();
        tracing::info!("Container event listener stopped");
    }

    /// Returns `true` when cancelled, `false` when the stream ended.
    async fn consume(&self, mut stream: LineStream, cancel: &CancellationToken) -> bool {
        let mut known = self.known_environments().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load environments for event matching");
            Vec::new()
        });
        let mut reload = tokio::time::interval(self.prefix_refresh);
        reload.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                _ = reload.tick() => {
                    match self.known_environments().await {
                        Ok(keys) => known = keys,
                        Err(e) => tracing::warn!(error = %e, "Failed to reload environments"),
                    }
                }
                line = stream.lines.recv() => {
                    let Some(line) = line else { return false };
                    let Some(event) = parse_event(&line) else { continue };
                    let Some(key) = match_container(&event.container, &known) else { continue };
                    tracing::debug!(
                        environment = %key,
                        container = %event.container,
                        action = %event.action,
                        "Container state changed"
                    );
                    let refresh = self.refresh.clone();
                    self.debouncer.schedule(async move { refresh.request() });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_transition() {
        let line = r#"{"status":"die","id":"abc","Type":"container","Action":"die","Actor":{"ID":"abc","Attributes":{"image":"mariadb:10.11","name":"mr-7-shop-db"}},"time":1700000000}"#;
        assert_eq!(
            parse_event(line),
            Some(ContainerEvent {
                action: "die".to_string(),
                container: "mr-7-shop-db".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_ignores_non_state_events() {
        let exec = r#"{"Action":"exec_start: bash -c ls","Actor":{"Attributes":{"name":"mr-7-shop-php"}}}"#;
        assert_eq!(parse_event(exec), None);
        let health = r#"{"Action":"health_status: healthy","Actor":{"Attributes":{"name":"mr-7-shop-php"}}}"#;
        assert_eq!(parse_event(health), None);
        assert_eq!(parse_event("not json"), None);
        assert_eq!(parse_event(r#"{"Action":"start"}"#), None);
    }

    #[test]
    fn test_parse_legacy_status_field() {
        let line = r#"{"status":"stop","Actor":{"Attributes":{"name":"branch-main-shop-php"}}}"#;
        assert_eq!(parse_event(line).unwrap().action, "stop");
    }
}
