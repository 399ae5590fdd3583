//! `boardclaw` — discover, monitor and flash Teensy-family boards.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use boardclaw::{
    message, upload_task, Board, BoardManager, Config, Error, Message, TeensyDriver, UploadOptions,
    UsbMonitor, VendorDriver,
};

#[derive(Parser, Debug)]
#[command(name = "boardclaw")]
#[command(version)]
#[command(about = "Manage a fleet of Teensy-family USB development boards.", long_about = None)]
struct Cli {
    /// Configuration file (built-in defaults are used when absent)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Select a board by identity, "<location>[#<serial>]"
    #[arg(long, global = true, value_name = "ID")]
    board: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List connected boards
    List,

    /// Upload a firmware image, rebooting the board into its bootloader
    /// when necessary
    Upload {
        /// Firmware file format (autodetected by default)
        #[arg(short = 'f', long, value_name = "FORMAT")]
        format: Option<String>,

        /// Do not reset the device once the upload is finished
        #[arg(long)]
        noreset: bool,

        /// Wait for the bootloader instead of rebooting the board
        #[arg(short = 'w', long)]
        wait: bool,

        /// Skip the firmware/model compatibility check
        #[arg(long)]
        nocheck: bool,

        /// Firmware file
        filename: PathBuf,
    },

    /// Reset the selected board into its firmware
    Reset,

    /// Reboot the selected board into its bootloader
    Reboot,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<Error>() {
                Some(core) => ExitCode::from(u8::try_from(core.exit_code()).unwrap_or(1)),
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    install_console_printer();

    let drivers: Vec<Box<dyn VendorDriver>> = vec![Box::new(TeensyDriver)];
    let manager = BoardManager::new(
        Box::new(UsbMonitor::new()),
        drivers,
        Duration::from_millis(config.monitor.drop_delay_ms),
    );

    let spec = cli.board.clone().unwrap_or_default();

    match cli.command {
        Commands::List => {
            manager.refresh()?;
            let boards = manager.matching_boards(&spec)?;
            if boards.is_empty() {
                println!("No boards connected");
                return Ok(());
            }
            for board in boards {
                let model = board.model().map_or("unknown model", |m| m.desc);
                println!("{} {} ({})", board.identity(), model, board.capabilities());
            }
        }

        Commands::Upload {
            format,
            noreset,
            wait,
            nocheck,
            filename,
        } => {
            let board = select_board(&manager, &spec)?;

            let mut options = UploadOptions::from_config(&config.upload);
            options.format = format;
            options.wait = wait;
            if noreset {
                options.reset_after = false;
            }
            if nocheck {
                options.check = false;
            }

            // Joining right away takes the in-caller fast path, so the
            // upload runs on this thread and drives the refresh loop
            // itself while it waits for the bootloader.
            let task = upload_task(board, filename, options);
            task.start(None)?;
            task.join()?;
        }

        Commands::Reset => {
            let board = select_board(&manager, &spec)?;
            board.reset()?;
            println!("Reset command sent to {}", board.identity());
        }

        Commands::Reboot => {
            let board = select_board(&manager, &spec)?;
            board.reboot()?;
            println!("Reboot command sent to {}", board.identity());
        }
    }

    Ok(())
}

fn select_board(manager: &BoardManager, spec: &str) -> Result<Arc<Board>> {
    manager.refresh()?;
    let mut boards = manager.matching_boards(spec)?;
    match boards.len() {
        0 => Err(Error::NotFound(format!(
            "No matching board found (looked for '{}')",
            if spec.is_empty() { "any" } else { spec }
        ))
        .into()),
        1 => Ok(boards.remove(0)),
        _ => Err(Error::Param(
            "Multiple boards connected, select one with --board".into(),
        )
        .into()),
    }
}

/// Route bus messages to the terminal: log lines to stdout/stderr,
/// progress as an in-place percentage.
fn install_console_printer() {
    message::bus().subscribe(|msg| match msg {
        Message::Log { level, text } => match level {
            boardclaw::LogLevel::Error | boardclaw::LogLevel::Warning => eprintln!("{text}"),
            _ => println!("{text}"),
        },
        Message::Progress {
            action, value, max, ..
        } => {
            if *max > 0 {
                print!("\r{action}... {}%", value * 100 / max);
                if value == max {
                    println!();
                }
                let _ = std::io::stdout().flush();
            }
        }
        Message::Status { .. } => {}
    });
}
