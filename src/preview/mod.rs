//! Preview environments: lifecycle orchestration back-end.
//!
//! ## Overview
//!
//! Each GitLab merge request (or manually requested branch) gets its own
//! Docker Compose stack under `<previews_base>/<project>/<name>`. Webhooks
//! and REST calls trigger deploys; background loops stop and erase idle
//! environments; observers follow status, deploy logs and actions over
//! WebSockets.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  GitLab  │ ───────> │  server.rs  (router, startup, Supervisor wiring) │
//! │ Browser  │ <─────── │    ├─ api.rs      (REST handlers, AppState)      │
//! └──────────┘ WebSocket│    ├─ webhook.rs  (merge-request events)         │
//!                       │    └─ ws.rs       (status/log/action channels)   │
//!                       │         │                                        │
//!                       │         │ Coordinator::trigger() / delete()      │
//!                       │         v                                        │
//!                       │  coordinator.rs  (per-environment lock, clone,   │
//!                       │         │         mirror sync)                   │
//!                       │         v                                        │
//!                       │  pipeline.rs  (deployment state machine)         │
//!                       │    ├─ compose.rs   (topology generator)          │
//!                       │    ├─ overlay.rs   (shared base-file mounts)     │
//!                       │    └─ runtime.rs   (ContainerRuntime commands)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module        | Responsibility                                          |
//! |---------------|---------------------------------------------------------|
//! | `models`      | `Environment`, `DeploymentRecord`, statuses, naming     |
//! | `db`          | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `policy`      | Runtime policy read from the settings table             |
//! | `process`     | Timed, process-group-isolated command runner            |
//! | `source`      | `SourceControl` trait, GitLab clone and branch lookup   |
//! | `sync`        | Mirror copy with preserved paths                        |
//! | `manifest`    | Project manifest (`preview.yml`) and deploy phases      |
//! | `retry`       | Bounded fixed-delay retry                               |
//! | `replay`      | Replayable frame buffer for late subscribers            |
//! | `deploy_log`  | Human-readable log of one deployment run                |
//! | `deploy_logs` | Live log streams keyed by deployment id                 |
//! | `actions`     | Deduplicated stop/start/restart/login/drush runs        |
//! | `hub`         | Status snapshots and change-only broadcast              |
//! | `events`      | Container event listener feeding status refreshes       |
//! | `debounce`    | Single-slot debounce timer                              |
//! | `scheduler`   | Idle-stop and idle-erase loops, `Supervisor`            |
//!
//! ## Typical Flow (merge request opened)
//!
//! 1. `POST /api/webhooks/gitlab` → `webhook::gitlab_webhook()` validates
//!    the token and checks the project is enabled.
//! 2. `Coordinator::trigger()` takes the environment's lock without
//!    waiting; a second delivery for the same environment is dropped.
//! 3. The branch is shallow-cloned to a temp dir and mirrored into the
//!    working directory.
//! 4. `Pipeline::run()` records a `running` deployment and runs the
//!    phase's steps: compose topology, stack up, dependencies, then for new
//!    environments the base database and the shared files overlay, and
//!    finally the deploy scripts. Every line streams to `deploy_logs`.
//! 5. The outcome is persisted and a status refresh is requested, which
//!    `StatusHub` broadcasts to `/ws` observers if anything changed.

pub mod actions;
pub mod api;
pub mod compose;
pub mod coordinator;
pub mod db;
pub mod debounce;
pub mod deploy_log;
pub mod deploy_logs;
pub mod events;
pub mod hub;
pub mod manifest;
pub mod models;
pub mod overlay;
pub mod pipeline;
pub mod policy;
pub mod process;
pub mod replay;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod sync;
pub mod webhook;
pub mod ws;

#[cfg(test)]
pub(crate) mod fakes;
