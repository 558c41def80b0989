#[macro_use]
mod cli;
pub mod cluster;
pub mod framework;
pub mod infrastructure;
pub mod utilities;

use std::process::ExitCode;

use clap::Parser;
use cli::display::{Message, MessageType};

// Entry point for the CLI application
fn main() -> ExitCode {
    // Handle all CLI setup that doesn't require async functionality
    if let Err(e) = cli::settings::setup_user_directory() {
        show_message!(
            MessageType::Error,
            Message {
                action: "Init".to_string(),
                details: format!(
                    "Failed to initialize ~/.clusterdoc, please check your permissions: {e:?}"
                ),
            }
        );
        return ExitCode::from(1);
    }

    let settings = match cli::settings::read_settings() {
        Ok(settings) => settings,
        Err(e) => {
            show_message!(
                MessageType::Error,
                Message {
                    action: "Settings".to_string(),
                    details: format!("Failed to read settings: {e}"),
                }
            );
            return ExitCode::from(1);
        }
    };

    let cli_result = cli::Cli::parse();

    let logger_settings = settings.logger.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    let result = runtime.block_on(async {
        cli::logger::setup_logging(&logger_settings);

        cli::top_command_handler(settings, &cli_result.command).await
    });

    match result {
        Ok(s) => {
            if !s.message.action.is_empty() || !s.message.details.is_empty() {
                show_message!(s.message_type, s.message);
            }
            ExitCode::from(0)
        }
        Err(e) => {
            show_message!(e.message_type, e.message);
            if let Some(err) = e.error {
                eprintln!("{err:?}");
            }
            ExitCode::from(1)
        }
    }
}
