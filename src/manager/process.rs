//! Worker process plumbing: command construction and output capture.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::ClientRecord;

/// Prefix applied to lines read from the worker's error channel.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// How to launch a worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments placed before the per-client arguments.
    pub args: Vec<String>,
    /// Extra environment shared by every worker (e.g. a `RUST_LOG` filter).
    pub env: Vec<(String, String)>,
    /// Forward `--dry-run` to workers.
    pub dry_run: bool,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            dry_run: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Per-client command line. Dates and the client id go on the command
    /// line; credentials and scheduling parameters only in the environment.
    pub fn client_args(&self, client: &ClientRecord) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--client-id".to_string(),
            client.id.to_string(),
            "--current".to_string(),
            client.current_date.to_string(),
        ]);
        if let Some(target) = client.target_date {
            args.extend(["--target".to_string(), target.to_string()]);
        }
        if let Some(min) = client.min_date {
            args.extend(["--min".to_string(), min.to_string()]);
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args
    }

    /// Build the command with piped output channels.
    pub(crate) fn build(&self, client: &ClientRecord) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.client_args(client))
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("EMAIL", &client.email)
            .env("PASSWORD", client.password.expose_secret())
            .env("COUNTRY_CODE", &client.country_code)
            .env("SCHEDULE_ID", &client.schedule_id)
            .env("FACILITY_ID", &client.facility_id)
            .env("REFRESH_DELAY", client.refresh_delay.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Which output channel a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// One event read from a worker's output channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutput {
    Line { channel: OutputChannel, text: String },
    ReadError(String),
}

impl WorkerOutput {
    /// Text recorded in the log for this event.
    pub fn log_message(&self) -> String {
        match self {
            Self::Line {
                channel: OutputChannel::Stdout,
                text,
            } => text.clone(),
            Self::Line {
                channel: OutputChannel::Stderr,
                text,
            } => format!("{ERROR_PREFIX}{text}"),
            Self::ReadError(e) => format!("Process error: {e}"),
        }
    }
}

/// Start line readers for both output channels of a freshly spawned child.
///
/// The receiver yields lines in arrival order and closes once both channels
/// reach end of file.
pub(crate) fn capture_output(child: &mut Child) -> mpsc::UnboundedReceiver<WorkerOutput> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputChannel::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputChannel::Stderr, tx);
    }
    rx
}

fn spawn_reader<R>(
    reader: R,
    channel: OutputChannel,
    tx: mpsc::UnboundedSender<WorkerOutput>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let event = WorkerOutput::Line {
                        channel,
                        text: text.to_string(),
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(WorkerOutput::ReadError(e.to_string()));
                    break;
                }
            }
        }
    })
}

/// Ask the child to exit. SIGTERM on unix; no escalation.
pub(crate) fn request_termination(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

/// Final log line for a terminated worker.
pub fn exit_message(status: &ExitStatus) -> String {
    match status.code() {
        Some(0) => "Bot completed successfully".to_string(),
        Some(code) => format!("Bot exited with code {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return format!("Bot terminated by signal {signal}");
                }
            }
            "Bot exited without a status code".to_string()
        }
    }
}
