//! Live deployment-log fan-out, one stream per in-flight deployment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::replay::{Replay, ReplaySubscription};
use super::ws::{WsMessage, encode};

pub struct DeploymentLogs {
    streams: Mutex<HashMap<i64, Replay>>,
    retention: Duration,
}

impl DeploymentLogs {
    /// `retention` is how long a finished stream stays available to late
    /// subscribers.
    pub fn new(retention: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn register(&self, deployment_id: i64) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(deployment_id, Replay::new());
        }
    }

    pub fn push(&self, deployment_id: i64, text: impl Into<String>) {
        let frame = encode(&WsMessage::Log {
            deployment_id,
            text: text.into(),
        });
        if let Ok(mut streams) = self.streams.lock()
            && let Some(replay) = streams.get_mut(&deployment_id)
        {
            replay.publish(frame);
        }
    }

    /// Send the terminal frame, then drop the buffer after the retention
    /// window.
    pub fn complete(self: &Arc<Self>, deployment_id: i64, success: bool) {
        let frame = encode(&WsMessage::Complete {
            deployment_id,
            success,
        });
        if let Ok(mut streams) = self.streams.lock()
            && let Some(replay) = streams.get_mut(&deployment_id)
        {
            replay.finish(frame);
        }

        let logs = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(logs.retention).await;
            if let Ok(mut streams) = logs.streams.lock() {
                streams.remove(&deployment_id);
            }
        });
    }

    /// Backlog plus live frames, or `None` for an unknown or expired
    /// deployment.
    pub fn subscribe(&self, deployment_id: i64) -> Option<ReplaySubscription> {
        let streams = self.streams.lock().ok()?;
        streams.get(&deployment_id).map(Replay::subscribe)
    }

    pub fn is_live(&self, deployment_id: i64) -> bool {
        self.streams
            .lock()
            .map(|s| s.get(&deployment_id).is_some_and(|r| !r.is_finished()))
            .unwrap_or(false)
    }
}
