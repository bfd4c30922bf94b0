//! Persisted runtime policy for `preview-manager settings`.

use anyhow::Result;

use preview_manager::config::Settings;
use preview_manager::preview::policy;
use preview_manager::preview::server;

use super::super::SettingsCommands;

pub fn cmd_settings(settings: &Settings, command: Option<SettingsCommands>) -> Result<()> {
    let handle = server::open_database(settings)?;
    let db = handle.lock_sync()?;

    match command {
        None | Some(SettingsCommands::List) => {
            let all = db.all_settings()?;
            if all.is_empty() {
                println!("No settings stored.");
            }
            for (key, value) in all {
                println!("{} = {}", key, value);
            }
        }
        Some(SettingsCommands::Get { key }) => match db.get_setting(&key)? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Setting '{}' is not set", key),
        },
        Some(SettingsCommands::Set { key, value }) => {
            policy::validate_setting(&key, &value).map_err(anyhow::Error::msg)?;
            db.set_setting(&key, &value)?;
            println!("{} = {}", key, value);
        }
        Some(SettingsCommands::Unset { key }) => {
            db.delete_setting(&key)?;
            println!("{} removed", key);
        }
    }
    Ok(())
}
