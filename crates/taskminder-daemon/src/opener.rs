//! Click-through launcher for reminder routes.
//!
//! Opens the app URL with an external program and reaps it in the background.

use std::process::Stdio;

use taskminder_core::program_in_path;
use taskminder_core::util::log_snippet;
use tokio::process::Command;
use tracing::{debug, warn};

/// Launch `program <url>` without waiting for it.
pub(crate) fn open_url(program: &str, url: &str) {
    let program = program.trim();
    if !program_in_path(program) {
        warn!(program, "open command not found on PATH; ignoring click");
        return;
    }
    let url_snip = log_snippet(url);
    let mut command = Command::new(program);
    command
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.spawn() {
        Ok(child) => {
            debug!(program, pid = child.id(), url = %url_snip, "opening reminder route");
            let program = program.to_string();
            tokio::spawn(reap_open_child(program, url_snip, child));
        }
        Err(err) => {
            warn!(program, url = %url_snip, ?err, "failed to spawn open command");
        }
    }
}

async fn reap_open_child(program: String, url_snip: String, mut child: tokio::process::Child) {
    // The opener may outlive the click (a browser started in the foreground); it is never killed.
    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            warn!(program = %program, url = %url_snip, status = ?status.code(), "open command failed");
        }
        Err(err) => {
            warn!(program = %program, ?err, "failed to wait for open command");
        }
    }
}
