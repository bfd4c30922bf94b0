//! Manual environment actions (stop, start, restart, login link, drush).
//!
//! The first caller for an (environment, action) pair becomes the leader
//! and actually runs the command. Callers arriving while it runs follow
//! along: they get the buffered output, the live output and the same
//! terminal outcome. The command runs in its own task, so it completes even
//! if every caller goes away.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::compose::container_name;
use super::hub::RefreshTrigger;
use super::models::EnvironmentKey;
use super::process::{self, CommandSpec};
use super::replay::{Replay, ReplaySubscription};
use super::runtime::ContainerRuntime;
use super::ws::{WsMessage, encode};
use crate::config::StepTimeouts;

const DRUSH: &str = "vendor/bin/drush";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Stop,
    Start,
    Restart,
    /// One-time login link.
    Login,
    Drush(Vec<String>),
}

impl ActionKind {
    /// Parse an action name. `drush` takes whitespace-separated `args`.
    pub fn parse(name: &str, args: Option<&str>) -> Option<Self> {
        match name {
            "stop" => Some(Self::Stop),
            "start" => Some(Self::Start),
            "restart" => Some(Self::Restart),
            "login" | "drush-uli" => Some(Self::Login),
            "drush" => {
                let args: Vec<String> = args
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                (!args.is_empty()).then_some(Self::Drush(args))
            }
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Stop => "stop".to_string(),
            Self::Start => "start".to_string(),
            Self::Restart => "restart".to_string(),
            Self::Login => "login".to_string(),
            Self::Drush(args) => format!("drush {}", args.join(" ")),
        }
    }

    pub fn command(
        &self,
        runtime: &dyn ContainerRuntime,
        dir: &Path,
        key: &EnvironmentKey,
        url: &str,
        timeouts: &StepTimeouts,
    ) -> (CommandSpec, Duration) {
        let php = container_name(key, "php");
        match self {
            Self::Stop => (runtime.compose_stop(dir), timeouts.compose_stop),
            Self::Start => (runtime.compose_start(dir), timeouts.compose_start),
            Self::Restart => (runtime.compose_restart(dir), timeouts.compose_start),
            Self::Login => (
                runtime
                    .exec(&php, &[DRUSH.to_string(), "uli".to_string(), format!("--uri={}", url)])
                    .current_dir(dir),
                timeouts.login_link,
            ),
            Self::Drush(args) => {
                let argv: Vec<String> = std::iter::once(DRUSH.to_string())
                    .chain(args.iter().cloned())
                    .collect();
                (runtime.exec(&php, &argv).current_dir(dir), timeouts.drush)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// Raw command output, or the failure text when it could not finish.
    pub output: String,
}

pub struct ActionTicket {
    pub action_id: String,
    /// Whether this caller started the action.
    pub leader: bool,
    pub frames: ReplaySubscription,
    outcome: watch::Receiver<Option<ActionOutcome>>,
}

impl ActionTicket {
    /// Wait for the terminal outcome.
    pub async fn outcome(mut self) -> ActionOutcome {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(aborted),
            Err(_) => aborted(),
        }
    }
}

fn aborted() -> ActionOutcome {
    ActionOutcome {
        success: false,
        output: "action aborted".to_string(),
    }
}

type ActionKey = (EnvironmentKey, String);

struct Running {
    id: String,
    replay: Replay,
    outcome: watch::Receiver<Option<ActionOutcome>>,
}

pub struct ActionHub {
    running: Mutex<HashMap<ActionKey, Running>>,
    retention: Duration,
    refresh: Option<RefreshTrigger>,
}

impl ActionHub {
    pub fn new(retention: Duration, refresh: Option<RefreshTrigger>) -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            retention,
            refresh,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ActionKey, Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, env: &EnvironmentKey, kind: &ActionKind) -> bool {
        self.lock()
            .get(&(env.clone(), kind.label()))
            .is_some_and(|r| !r.replay.is_finished())
    }

    /// Join the in-flight run of `kind` for `env`, or start `spec` as a new
    /// one.
    pub fn start_or_join(
        self: &Arc<Self>,
        env: &EnvironmentKey,
        kind: &ActionKind,
        spec: CommandSpec,
        limit: Duration,
    ) -> ActionTicket {
        let key: ActionKey = (env.clone(), kind.label());
        let mut running = self.lock();

        if let Some(current) = running.get(&key)
            && !current.replay.is_finished()
        {
            tracing::info!(environment = %env, action = %key.1, "Joining running action");
            return ActionTicket {
                action_id: current.id.clone(),
                leader: false,
                frames: current.replay.subscribe(),
                outcome: current.outcome.clone(),
            };
        }

        let id = Uuid::new_v4().to_string();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let mut replay = Replay::new();
        replay.publish(encode(&WsMessage::ActionStarted {
            action_id: id.clone(),
            project: env.project.clone(),
            name: env.name.clone(),
            action: key.1.clone(),
            command: spec.display(),
        }));
        let frames = replay.subscribe();
        running.insert(
            key.clone(),
            Running {
                id: id.clone(),
                replay,
                outcome: outcome_rx.clone(),
            },
        );
        drop(running);

        tracing::info!(environment = %env, action = %key.1, action_id = %id, "Starting action");
        let hub = Arc::clone(self);
        let action_id = id.clone();
        tokio::spawn(async move {
            let outcome = hub.execute(&key, &action_id, &spec, limit).await;
            tracing::info!(
                environment = %key.0,
                action = %key.1,
                success = outcome.success,
                "Action finished"
            );
            hub.publish(
                &key,
                &action_id,
                encode(&WsMessage::ActionComplete {
                    action_id: action_id.clone(),
                    success: outcome.success,
                    output: outcome.output.clone(),
                }),
                true,
            );
            let _ = outcome_tx.send(Some(outcome));
            if let Some(refresh) = &hub.refresh {
                refresh.request();
            }

            tokio::time::sleep(hub.retention).await;
            let mut running = hub.lock();
            if running.get(&key).is_some_and(|r| r.id == action_id) {
                running.remove(&key);
            }
        });

        ActionTicket {
            action_id: id,
            leader: true,
            frames,
            outcome: outcome_rx,
        }
    }

    async fn execute(
        &self,
        key: &ActionKey,
        action_id: &str,
        spec: &CommandSpec,
        limit: Duration,
    ) -> ActionOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let forward = async {
            while let Some(line) = rx.recv().await {
                let frame = encode(&WsMessage::ActionOutput {
                    action_id: action_id.to_string(),
                    line,
                });
                self.publish(key, action_id, frame, false);
            }
        };
        let (result, ()) = tokio::join!(process::run_streaming(spec, limit, Some(tx)), forward);
        match result {
            Ok(out) => ActionOutcome {
                success: out.success(),
                output: out.output,
            },
            Err(e) => ActionOutcome {
                success: false,
                output: e.to_string(),
            },
        }
    }

    fn publish(&self, key: &ActionKey, action_id: &str, frame: String, last: bool) {
        let mut running = self.lock();
        if let Some(current) = running.get_mut(key).filter(|r| r.id == action_id) {
            if last {
                current.replay.finish(frame);
            } else {
                current.replay.publish(frame);
            }
        }
    }
}
