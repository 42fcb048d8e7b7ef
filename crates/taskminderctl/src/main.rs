//! Command-line control surface for the Taskminder D-Bus interface.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use taskminder_core::{ControlProxy, ScheduleState};
use zbus::Connection;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the reminder document
    Read,
    /// Replace the reminder document from a file, or stdin with `-`
    Write {
        #[arg(default_value = "-")]
        file: PathBuf,
    },
    /// Re-derive every timer from the document
    Rebuild,
    /// Show scheduler state
    State,
    /// Send a test notification
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let connection = Connection::session()
        .await
        .context("connect to session bus")?;
    let proxy = ControlProxy::new(&connection)
        .await
        .context("connect to taskminder control interface")?;

    match args.command {
        Command::Read => println!("{}", proxy.read_tasks().await?),
        Command::Write { file } => {
            let payload = read_payload(&file)?;
            proxy.write_tasks(&payload).await?;
            println!("{}", serde_json::json!({ "ok": true }));
        }
        Command::Rebuild => print_state(&proxy.rebuild().await?)?,
        Command::State => print_state(&proxy.get_state().await?)?,
        Command::Test => proxy.test_notification().await?,
    }

    Ok(())
}

/// Load and validate a document before it goes over the bus.
fn read_payload(file: &Path) -> Result<String> {
    let raw = if file.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("read document from stdin")?;
        raw
    } else {
        std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?
    };
    let value: Value = serde_json::from_str(&raw).context("document is not valid JSON")?;
    Ok(value.to_string())
}

fn print_state(state: &ScheduleState) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}
