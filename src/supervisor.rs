//! Spawns the administrative child process and turns its exit into an
//! outcome event. Grounded on `yadtreceiver.protocols.ProcessProtocol`,
//! adapted from Twisted's `ProcessProtocol` callbacks to a single
//! `tokio::process::Command` spawn plus an awaited exit.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Describes one child invocation for logging purposes. Built once per
/// request and threaded through to the outcome event.
#[derive(Debug, Clone)]
pub struct ProcessRun {
    pub host: String,
    pub target: String,
    pub readable_command: String,
    pub tracking_id: Option<String>,
}

impl ProcessRun {
    pub fn new(
        host: impl Into<String>,
        target: impl Into<String>,
        readable_command: impl Into<String>,
        tracking_id: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            readable_command: readable_command.into(),
            tracking_id,
        }
    }

    /// `(interpreter_command, script, message)` -> `"interpreter script message..."`,
    /// matching `' '.join(command_and_arguments_list)` in the source.
    pub fn readable(interpreter_command: &str, script_to_execute: &str, arguments: &[String]) -> String {
        let mut parts = Vec::with_capacity(arguments.len() + 2);
        parts.push(interpreter_command);
        parts.push(script_to_execute);
        parts.extend(arguments.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Outcome of a completed child process, ready to become a `Command` event.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The succinct success message published on the wire is built by the
    /// caller, which already knows the hostname and readable command this
    /// module has no reason to track a second time.
    Finished,
    /// `message` is the captured stderr contents (the spec.md §4.C Command
    /// event body); `code` is the process exit code, kept alongside for the
    /// local log line (`return code was {code}.`) but not published on the
    /// wire.
    Failed { message: String, code: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn {command:?} in {cwd}: {source}")]
    Io {
        command: String,
        cwd: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Rendered as `"{kind} : {text}"`, matching the source's
    /// `"%s : %s" % (type(e), e.message)` formatting for caught exceptions.
    pub fn kind_and_text(&self) -> String {
        match self {
            SpawnError::Io { source, .. } => format!("{:?} : {source}", source.kind()),
        }
    }
}

/// Spawns `interpreter_command script_to_execute <arguments...>` with an
/// empty environment and `cwd` as the working directory, discarding stdout
/// and capturing stderr in full, then maps the exit status to an
/// [`Outcome`]. Never retries; retry policy belongs to the caller.
pub async fn spawn_and_await(
    cwd: &Path,
    interpreter_command: &str,
    script_to_execute: &str,
    arguments: &[String],
) -> Result<Outcome, SpawnError> {
    let mut command = Command::new(interpreter_command);
    command
        .arg(script_to_execute)
        .args(arguments)
        .current_dir(cwd)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(|source| SpawnError::Io {
        command: format!("{interpreter_command} {script_to_execute}"),
        cwd: cwd.display().to_string(),
        source,
    })?;

    let output = child.wait_with_output().await.map_err(|source| SpawnError::Io {
        command: format!("{interpreter_command} {script_to_execute}"),
        cwd: cwd.display().to_string(),
        source,
    })?;

    if output.status.success() {
        Ok(Outcome::Finished)
    } else {
        // stderr is treated as opaque bytes (spec.md §9); only decoded
        // defensively, and only for the outcome message.
        let message = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);
        Ok(Outcome::Failed { message, code })
    }
}
