//! Buffered fan-out for streams that late subscribers must see in full.
//!
//! A [`Replay`] keeps every serialized frame it has published. A subscriber
//! gets the backlog plus a live receiver, taken together so no frame is
//! missed or duplicated. Once finished, the sender is dropped: live
//! receivers drain the final frame and then observe `Closed`.

use tokio::sync::broadcast;

const LIVE_CAPACITY: usize = 1024;

pub struct Replay {
    frames: Vec<String>,
    tx: Option<broadcast::Sender<String>>,
}

pub struct ReplaySubscription {
    pub backlog: Vec<String>,
    /// `None` once the stream has finished; the backlog is then complete.
    pub live: Option<broadcast::Receiver<String>>,
}

impl Replay {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            frames: Vec::new(),
            tx: Some(tx),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tx.is_none()
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn publish(&mut self, frame: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(frame.clone());
            self.frames.push(frame);
        }
    }

    /// Publish the terminal frame and close the live channel.
    pub fn finish(&mut self, frame: String) {
        self.publish(frame);
        self.tx = None;
    }

    pub fn subscribe(&self) -> ReplaySubscription {
        ReplaySubscription {
            backlog: self.frames.clone(),
            live: self.tx.as_ref().map(broadcast::Sender::subscribe),
        }
    }
}

impl Default for Replay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog_then_live() {
        let mut replay = Replay::new();
        replay.publish("a".to_string());
        let mut sub = replay.subscribe();
        replay.publish("b".to_string());
        replay.finish("done".to_string());

        assert_eq!(sub.backlog, vec!["a".to_string()]);
        let live = sub.live.as_mut().unwrap();
        assert_eq!(live.recv().await.unwrap(), "b");
        assert_eq!(live.recv().await.unwrap(), "done");
        assert!(matches!(
            live.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn test_subscribe_after_finish_is_backlog_only() {
        let mut replay = Replay::new();
        replay.publish("a".to_string());
        replay.finish("done".to_string());
        replay.publish("ignored".to_string());

        let sub = replay.subscribe();
        assert!(replay.is_finished());
        assert!(sub.live.is_none());
        assert_eq!(sub.backlog, vec!["a".to_string(), "done".to_string()]);
    }
}
