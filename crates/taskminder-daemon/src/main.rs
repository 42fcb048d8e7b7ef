//! Daemon entrypoint and service bootstrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use taskminder_core::{ConfigDocument, LinkProfile, CONTROL_BUS_NAME, CONTROL_OBJECT_PATH};
use tokio::sync::mpsc;
use tracing::{info, warn};
use zbus::fdo::RequestNameReply;
use zbus::Connection;

mod control;
mod opener;
mod scheduler;
mod sink;
mod store;
mod timers;
mod watcher;
#[path = "runtime_config.rs"]
mod runtime_config;
#[path = "shutdown_signal.rs"]
mod shutdown_signal;

use crate::control::{forward_rebuilds, request_control_name, ControlServer};
use crate::runtime_config::{config_source, init_tracing, load_config, tasks_path};
use crate::scheduler::{Scheduler, SchedulerSettings, SystemClock};
use crate::shutdown_signal::shutdown_signal;
use crate::sink::{AppUrlSource, DesktopSink, LogSink, NotificationSink};
use crate::store::{DocumentStore, StoreError};
use crate::watcher::watch_document;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the reminder document (overrides the config)
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// Log reminders instead of showing desktop notifications
    #[arg(long)]
    log_only: bool,

    /// Validate configuration and the reminder document, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("load config")?;

    init_tracing(&config);
    info!(config_source = config_source(&args), "configuration loaded");
    if taskminder_core::util::diagnostic_mode() {
        info!(
            limit = taskminder_core::util::log_limit(),
            "diagnostic logging enabled (snippets capped; newlines stripped)"
        );
    }

    let tasks_path = tasks_path(&args, &config)?;
    info!(path = %tasks_path.display(), "reminder document");

    if args.check {
        let (document, problem) = DocumentStore::new(tasks_path.clone()).read_checked();
        // A missing document is an empty schedule.
        if let Some(err) = problem.filter(|err| !matches!(err, StoreError::NotFound(_))) {
            return Err(anyhow!(err).context("reminder document is not usable"));
        }
        info!(
            entries = document.items.len(),
            tasks = document.tasks.len(),
            "configuration and reminder document loaded successfully"
        );
        return Ok(());
    }

    let connection = match Connection::session().await {
        Ok(connection) => Some(connection),
        Err(err) if args.log_only => {
            warn!(?err, "no session bus; control interface disabled");
            None
        }
        Err(err) => return Err(err).context("connect to session bus"),
    };

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let store = DocumentStore::new(tasks_path.clone()).with_change_signal(change_tx.clone());
    let watcher = watch_document(&tasks_path, change_tx).context("watch reminder document")?;
    info!(path = %watcher.path().display(), "watching reminder document");

    let sink: Arc<dyn NotificationSink> = match (&connection, args.log_only) {
        (Some(connection), false) => Arc::new(DesktopSink::start(
            connection.clone(),
            config.notifications.clone(),
            app_url_source(tasks_path.clone(), config.notifications.link_profile),
        )),
        _ => Arc::new(LogSink),
    };

    let scheduler = Scheduler::new(
        store,
        sink,
        Arc::new(SystemClock),
        SchedulerSettings::from_config(&config.scheduler),
    );
    let (handle, scheduler_task) = scheduler.start(change_rx);

    if let Some(connection) = &connection {
        connection
            .object_server()
            .at(CONTROL_OBJECT_PATH, ControlServer::new(handle.clone()))
            .await?;
        match request_control_name(connection).await? {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => {
                info!(CONTROL_BUS_NAME, "acquired control bus name");
            }
            _ => {
                handle.shutdown();
                return Err(anyhow!(
                    "control bus name is already owned; another taskminder instance may be running"
                ));
            }
        }
        tokio::spawn(forward_rebuilds(connection.clone(), handle.subscribe()));
    }

    info!("taskminder-daemon running");
    shutdown_signal().await;

    handle.shutdown();
    if let Err(err) = scheduler_task.await {
        warn!(?err, "scheduler task ended abnormally");
    }
    drop(watcher);
    if let Some(connection) = connection {
        if let Err(err) = connection.release_name(CONTROL_BUS_NAME).await {
            warn!(?err, "failed to release control bus name");
        }
    }
    Ok(())
}

/// Reads the app URL from the document on each click so edits apply at once.
fn app_url_source(path: PathBuf, profile: LinkProfile) -> AppUrlSource {
    Arc::new(move || read_app_url(&path, profile))
}

fn read_app_url(path: &Path, profile: LinkProfile) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let document: ConfigDocument = serde_json::from_str(&raw).ok()?;
    document.app_url(profile)
}
