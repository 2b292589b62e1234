//! Console commands
//! This module defines the commands the console host can issue to the bridge.

use std::str::FromStr;

use crate::core::bluetooth::on_off;
use crate::state::AppState;

pub const HELP: &str = "commands: <name> on | <name> off | <name> get | status | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch an accessory on or off
    Set { name: String, on: bool },
    /// Read an accessory's current state
    Get { name: String },
    /// Show every session
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        match line.to_lowercase().as_str() {
            "" => return Err(HELP.to_string()),
            "status" => return Ok(Self::Status),
            "help" | "?" => return Ok(Self::Help),
            "quit" | "exit" => return Ok(Self::Quit),
            _ => {}
        }

        let (name, action) = line
            .rsplit_once(char::is_whitespace)
            .ok_or_else(|| format!("unknown command {:?}; {}", line, HELP))?;
        let name = name.trim().to_string();
        match action.to_lowercase().as_str() {
            "on" => Ok(Self::Set { name, on: true }),
            "off" => Ok(Self::Set { name, on: false }),
            "get" => Ok(Self::Get { name }),
            _ => Err(format!("unknown action {:?}; {}", action, HELP)),
        }
    }
}

/// Runs a command against the bridge and returns the text to show
///
/// # Arguments
/// * `command` - The parsed command; `Quit` is handled by the caller
/// * `app_state` - The application state
pub async fn execute(command: &Command, app_state: &AppState) -> Result<String, String> {
    match command {
        Command::Set { name, on } => {
            let accessory = app_state
                .accessory(name)
                .ok_or_else(|| format!("unknown accessory {:?}", name))?;
            accessory.set_on(*on).await.map_err(|e| e.to_string())?;
            Ok(format!("{} -> {}", accessory.name(), on_off(*on)))
        }
        Command::Get { name } => {
            let accessory = app_state
                .accessory(name)
                .ok_or_else(|| format!("unknown accessory {:?}", name))?;
            let value = accessory.get_on().await.map_err(|e| e.to_string())?;
            Ok(format!("{} is {}", accessory.name(), on_off(value)))
        }
        Command::Status => Ok(status(app_state)),
        Command::Help | Command::Quit => Ok(HELP.to_string()),
    }
}

fn status(app_state: &AppState) -> String {
    let accessories = app_state.bluetooth_manager.accessories();
    if accessories.is_empty() {
        return "no accessories configured".to_string();
    }

    accessories
        .iter()
        .map(|accessory| {
            let view = accessory.view();
            let mut line = format!("{}: {} (epoch {})", accessory.name(), view.state, view.epoch);
            if let Some(value) = app_state.last_value(accessory.name()) {
                line.push_str(&format!(", last {}", on_off(value)));
            }
            if view.retry_pending {
                line.push_str(", retry pending");
            }
            if let Some(fault) = &view.fault {
                line.push_str(&format!(", fault: {}", fault));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
