use anyhow::{Result, anyhow};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use ble_switch_bridge_lib::commands::{self, Command};
use ble_switch_bridge_lib::config::BridgeConfig;
use ble_switch_bridge_lib::logging;
use ble_switch_bridge_lib::state::AppState;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    if let Err(e) = logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config_path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: ble-switch-bridge <config.json>"))?;
    let config = BridgeConfig::load(&config_path).await?;
    logging::set_level(config.level_filter()?);

    let app_state = AppState::new(&config).await?;
    app_state.bluetooth_manager.start();
    info!("Bridge running. {}", commands::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
            line = lines.next_line(), if console_open => match line {
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(Command::Quit) => break,
                    Ok(command) => match commands::execute(&command, &app_state).await {
                        Ok(output) => println!("{}", output),
                        Err(e) => println!("error: {}", e),
                    },
                    Err(e) => println!("{}", e),
                },
                Ok(None) => {
                    info!("Console closed, running until Ctrl-C.");
                    console_open = false;
                }
                Err(e) => {
                    error!("Failed to read console input: {}", e);
                    console_open = false;
                }
            }
        }
    }

    app_state.bluetooth_manager.shutdown().await;
    Ok(())
}
