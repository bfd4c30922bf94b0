//! CLI command implementations.
//!
//! | Module     | Commands handled              |
//! |------------|-------------------------------|
//! | `serve`    | `Serve`                       |
//! | `db`       | `InitDb`, `Remount`           |
//! | `settings` | `Settings`                    |

pub mod db;
pub mod serve;
pub mod settings;

pub use db::{cmd_init_db, cmd_remount};
pub use serve::cmd_serve;
pub use settings::cmd_settings;
