use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Split};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace, warn};

use super::process_tree;

/// Line patterns looked for in the engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    ready: String,
    fatal: Vec<String>,
}

impl Markers {
    /// Custom markers. A line is matched when it contains the pattern.
    pub fn new<I, S>(ready: impl Into<String>, fatal: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ready: ready.into(),
            fatal: fatal.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the engine announces it can accept a match.
    pub fn is_ready(&self, line: &str) -> bool {
        line.contains(&self.ready)
    }

    /// Whether the engine hit an error it will not recover from.
    pub fn is_fatal(&self, line: &str) -> bool {
        self.fatal.iter().any(|marker| line.contains(marker.as_str()))
    }
}

impl Default for Markers {
    fn default() -> Self {
        Self::new("Waiting to launch a game", ["Exception", "Error", "SEVERE"])
    }
}

/// Where the engine process stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessState {
    /// Not reaped yet.
    #[default]
    Running,
    /// Reaped, with its exit status.
    Exited(ExitStatus),
    /// Supervision stopped before the exit status could be collected.
    Lost,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(status) => match status.code() {
                Some(code) => write!(f, "exit code {code}"),
                None => write!(f, "{status}"),
            },
            ProcessState::Lost => write!(f, "lost"),
        }
    }
}

/// Everything the log tail learned about one engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineStatus {
    /// Set once the readiness marker was seen. Never reset.
    pub ready: bool,
    /// The line that got the engine killed, if any.
    pub fatal: Option<String>,
    /// Process liveness.
    pub process: ProcessState,
}

/// Flip the ready flag. Returns `false` when it was already set.
pub(crate) fn mark_ready(status: &watch::Sender<EngineStatus>) -> bool {
    status.send_if_modified(|s| {
        if s.ready {
            false
        } else {
            s.ready = true;
            true
        }
    })
}

/// Append-only log file of one engine, flushed on every line.
#[derive(Debug)]
pub(crate) struct LogSink {
    path: PathBuf,
    file: File,
}

impl LogSink {
    pub(crate) async fn open(dir: &Path, port: u16, started_at: &str) -> anyhow::Result<LogSink> {
        let path = dir.join(format!("instance-{port}-{started_at}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("could not open engine log {}", path.display()))?;
        Ok(LogSink { path, file })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await
    }
}

enum Event {
    Kill,
    Exited(std::io::Result<ExitStatus>),
    Drained,
    Line(std::io::Result<Option<Vec<u8>>>, Stream),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Out,
    Err,
}

async fn next_line<R: AsyncBufRead + Unpin>(
    reader: &mut Option<Split<R>>,
) -> std::io::Result<Option<Vec<u8>>> {
    match reader {
        Some(reader) => reader.next_segment().await,
        None => std::future::pending().await,
    }
}

/// Follows the output of one engine for as long as it lives.
///
/// Sole writer of the engine's [`EngineStatus`].
pub(crate) struct LogTail {
    pub(crate) port: u16,
    pub(crate) pid: Option<u32>,
    pub(crate) child: Child,
    pub(crate) sink: LogSink,
    pub(crate) markers: Arc<Markers>,
    pub(crate) status: watch::Sender<EngineStatus>,
    pub(crate) kill_switch: CancellationToken,
    pub(crate) verbose: bool,
}

impl LogTail {
    /// How long output is still read once the engine exited, when some descendant keeps
    /// the pipes open.
    const EXIT_DRAIN: Duration = Duration::from_millis(500);

    #[instrument(skip_all, fields(port = self.port))]
    pub(crate) async fn run(mut self) {
        let mut out = self.child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut err = self.child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut sink_broken = false;
        let mut exited = None;
        let drain = sleep(Self::EXIT_DRAIN);
        tokio::pin!(drain);

        while out.is_some() || err.is_some() {
            let event = tokio::select! {
                biased;
                _ = self.kill_switch.cancelled() => Event::Kill,
                _ = &mut drain, if exited.is_some() => Event::Drained,
                status = self.child.wait(), if exited.is_none() => Event::Exited(status),
                line = next_line(&mut out), if out.is_some() => Event::Line(line, Stream::Out),
                line = next_line(&mut err), if err.is_some() => Event::Line(line, Stream::Err),
            };

            let bytes = match event {
                Event::Kill => break,
                Event::Exited(status) => {
                    trace!("engine exited, draining output");
                    exited = Some(status);
                    drain.as_mut().reset(Instant::now() + Self::EXIT_DRAIN);
                    continue;
                }
                Event::Drained => {
                    warn!("engine exited with its output still open, killing its group");
                    self.kill_group();
                    break;
                }
                Event::Line(Ok(Some(bytes)), _) => bytes,
                Event::Line(result, stream) => {
                    if let Err(e) = result {
                        warn!(?stream, "could not read engine output: {e}");
                    }
                    match stream {
                        Stream::Out => out = None,
                        Stream::Err => err = None,
                    }
                    continue;
                }
            };

            let line = String::from_utf8_lossy(&bytes);
            let line = line.trim();
            if let Err(e) = self.sink.append(line).await {
                if !sink_broken {
                    error!(path = %self.sink.path().display(), "could not write engine log: {e}");
                    sink_broken = true;
                }
            }

            if self.markers.is_ready(line) && mark_ready(&self.status) {
                info!("engine ready");
            }

            if self.markers.is_fatal(line) {
                self.on_fatal(line);
                break;
            }
        }
        trace!("output closed");

        let exit = match exited {
            Some(status) => status,
            None => tokio::select! {
                biased;
                status = self.child.wait() => status,
                _ = self.kill_switch.cancelled() => {
                    self.start_kill();
                    self.child.wait().await
                }
            },
        };

        let state = match exit {
            Ok(status) => {
                info!(%status, "engine exited");
                ProcessState::Exited(status)
            }
            Err(e) => {
                warn!("could not collect engine exit status: {e}");
                ProcessState::Lost
            }
        };
        self.status.send_modify(|s| s.process = state);
    }

    /// Kill the process group of the engine, or what is left of it once it was reaped.
    fn kill_group(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = process_tree::terminate(pid) {
                warn!(pid, "{e:#}");
            }
        }
    }

    fn on_fatal(&mut self, line: &str) {
        error!(line, "critical error, killing engine");
        if self.verbose {
            println!("\x1b[31m!!! CRITICAL ERROR ON PORT {} !!!\x1b[39m\n{line}", self.port);
        }
        self.status.send_modify(|s| s.fatal = Some(line.to_owned()));
        self.kill_switch.cancel();
        self.kill_group();
        self.start_kill();
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            trace!("start_kill: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_markers() {
        let markers = Markers::default();
        assert!(markers.is_ready("[INFO] Waiting to launch a game"));
        assert!(!markers.is_ready("Launching game"));
        assert!(markers.is_fatal("java.lang.NullPointerException: frame"));
        assert!(markers.is_fatal("Error: could not find main class"));
        assert!(markers.is_fatal("SEVERE: socket closed"));
        assert!(!markers.is_fatal("error lowercase is fine"));
        assert!(!markers.is_fatal("Round 1 started"));
    }

    #[test]
    fn custom_markers() {
        let markers = Markers::new("READY", ["panic"]);
        assert!(markers.is_ready("READY on 8000"));
        assert!(markers.is_fatal("thread panicked: panic"));
        assert!(!markers.is_fatal("Exception"));
    }

    #[cfg(unix)]
    #[test]
    fn process_state_display() {
        use std::os::unix::process::ExitStatusExt;

        let exited = ProcessState::Exited(ExitStatus::from_raw(3 << 8));
        assert_eq!(exited.to_string(), "exit code 3");
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Lost.to_string(), "lost");
    }

    #[test]
    fn ready_flag_is_set_once() {
        let (tx, rx) = watch::channel(EngineStatus::default());
        assert!(!rx.borrow().ready);
        assert!(mark_ready(&tx));
        assert!(rx.borrow().ready);
        assert!(!mark_ready(&tx));
        assert!(rx.borrow().ready);
    }

    #[tokio::test]
    async fn sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), 8123, "2025.01.02_03.04.05")
            .await
            .unwrap();
        assert_eq!(
            sink.path(),
            dir.path().join("instance-8123-2025.01.02_03.04.05.log")
        );
        sink.append("first").await.unwrap();
        sink.append("second").await.unwrap();

        let mut reopened = LogSink::open(dir.path(), 8123, "2025.01.02_03.04.05")
            .await
            .unwrap();
        reopened.append("third").await.unwrap();

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "first\nsecond\nthird\n");
    }
}
