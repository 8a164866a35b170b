//! Supervision of the external game engine processes.
//!
//! The [`Supervisor`] launches one engine per port. Each engine gets:
//!
//! - an append-only log file, opened before the process starts,
//! - a log tail routine that copies stdout and stderr into that file line by line,
//!   flips the instance to *ready* on the readiness marker and kills the engine on a
//!   fatal marker,
//! - a kill switch, used by [`EngineInstance::kill`].
//!
//! The tail routines are spawned into a [`JoinSet`] owned by the caller, so they never
//! outlive the experiment.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use time::{format_description, OffsetDateTime};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, trace, warn};

use crate::configuration::ExperimentConfig;

mod log_tail;
mod process_tree;

pub use log_tail::{EngineStatus, Markers, ProcessState};
use log_tail::{LogSink, LogTail};

/// Program and arguments used to start an engine. `--port <N>` is appended per instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl EngineCommand {
    /// Any program with fixed arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
        }
    }

    /// Run the program from `dir`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Headless FightingICE engine driven through its Python gateway mode.
    ///
    /// The frame limit is `game_duration_seconds × 60` (the engine runs at 60 fps).
    pub fn fighting_ice(
        java: &str,
        engine_dir: &Path,
        player_hit_points: u32,
        game_duration_seconds: u64,
    ) -> Self {
        let separator = if cfg!(windows) { ";" } else { ":" };
        let classpath = ["dare.jar", "."].join(separator);
        let hp = player_hit_points.to_string();
        let frames = game_duration_seconds.saturating_mul(60).to_string();
        Self::new(
            java,
            [
                "-cp",
                classpath.as_str(),
                "Main",
                "--limithp",
                hp.as_str(),
                hp.as_str(),
                "-df",
                "-r",
                "1",
                "-f",
                frames.as_str(),
                "--headless-mode",
                "--input-sync",
                "--lightweight-mode",
                "--pyftg-mode",
                "--non-delay",
                "2",
            ],
        )
        .in_dir(engine_dir)
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Fixed arguments, without the port.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn for_port(&self, port: u16) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).arg("--port").arg(port.to_string());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl Display for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One running engine, as seen from the orchestrator.
///
/// The process itself is owned by its log tail routine; this handle only observes it and
/// can ask for it to be killed.
#[derive(Debug)]
pub struct EngineInstance {
    port: u16,
    pid: Option<u32>,
    log_path: PathBuf,
    status: watch::Receiver<EngineStatus>,
    kill_switch: CancellationToken,
}

impl EngineInstance {
    /// Port handed to the engine.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, when the platform reported one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Log file of this engine.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Snapshot of what is known about the engine.
    pub fn status(&self) -> EngineStatus {
        let mut status = self.status.borrow().clone();
        // Tail routine gone without reporting an exit status
        if status.process == ProcessState::Running && self.status.has_changed().is_err() {
            status.process = ProcessState::Lost;
        }
        status
    }

    /// Whether the readiness marker has been seen.
    pub fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    /// Whether the process has not been reaped yet.
    pub fn is_alive(&self) -> bool {
        self.status().process == ProcessState::Running
    }

    /// Wait for the readiness marker. Returns `false` if the engine stopped before.
    pub async fn wait_ready(&self) -> bool {
        let mut status = self.status.clone();
        let seen = match status
            .wait_for(|s| s.ready || s.process != ProcessState::Running)
            .await
        {
            Ok(s) => Some(s.ready),
            Err(_) => None,
        };
        seen.unwrap_or_else(|| status.borrow().ready)
    }

    /// Wait until the process is reaped (or supervision stops) and return the last status.
    pub async fn wait_exit(&self) -> EngineStatus {
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.process != ProcessState::Running)
            .await;
        self.status()
    }

    /// Kill the engine and its whole process tree.
    ///
    /// A no-op when the process already exited, so calling it several times is fine.
    pub fn kill(&self) -> anyhow::Result<()> {
        if !self.is_alive() {
            trace!(port = self.port, "engine already stopped");
            return Ok(());
        }
        self.kill_switch.cancel();

        let Some(pid) = self.pid else {
            return Ok(());
        };
        info!(pid, port = self.port, "forcefully killing process tree");
        process_tree::terminate(pid)
            .with_context(|| format!("could not kill engine on port {} (PID {pid})", self.port))
    }
}

/// Kill every instance. Failures are logged and returned, they never stop the loop.
pub fn kill_all(instances: &[EngineInstance]) -> Vec<(u16, anyhow::Error)> {
    let mut failures = vec![];
    for instance in instances {
        if let Err(e) = instance.kill() {
            warn!(port = instance.port, "{e:#}");
            failures.push((instance.port, e));
        }
    }
    failures
}

/// Launches engines and wires their log tails.
#[derive(Debug, Clone)]
pub struct Supervisor {
    command: EngineCommand,
    log_dir: PathBuf,
    started_at: String,
    markers: Arc<Markers>,
    verbose: bool,
}

impl Supervisor {
    /// Supervisor writing logs under the experiment log directory, stamped with the current
    /// UTC time.
    pub fn new(config: &ExperimentConfig) -> anyhow::Result<Supervisor> {
        let format = format_description::parse("[year].[month].[day]_[hour].[minute].[second]")?;
        let started_at = OffsetDateTime::now_utc()
            .format(&format)
            .context("could not format start time")?;

        Ok(Supervisor {
            command: config.engine_command(),
            log_dir: config.experiment_log_dir(),
            started_at,
            markers: Arc::new(Markers::default()),
            verbose: config.verbose,
        })
    }

    /// Use other readiness and fatal markers.
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = Arc::new(markers);
        self
    }

    /// Start one engine on `port` and its log tail inside `tails`.
    #[instrument(skip(self, tails))]
    pub async fn spawn(
        &self,
        port: u16,
        tails: &mut JoinSet<()>,
    ) -> anyhow::Result<EngineInstance> {
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .with_context(|| format!("could not create {}", self.log_dir.display()))?;
        let sink = LogSink::open(&self.log_dir, port, &self.started_at).await?;

        let mut command = self.command.for_port(port);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process_tree::isolate(&mut command);
        let child = command
            .spawn()
            .with_context(|| format!("could not launch engine '{}'", self.command.program))?;

        let pid = child.id();
        let log_path = sink.path().to_owned();
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());
        let kill_switch = CancellationToken::new();

        tails.spawn(
            LogTail {
                port,
                pid,
                child,
                sink,
                markers: self.markers.clone(),
                status: status_tx,
                kill_switch: kill_switch.clone(),
                verbose: self.verbose,
            }
            .run(),
        );

        info!(?pid, port, log = %log_path.display(), "engine started");
        if self.verbose {
            match pid {
                Some(pid) => println!("Engine started (PID: {pid}, PORT: {port})."),
                None => println!("Engine started (PORT: {port})."),
            }
        }

        Ok(EngineInstance {
            port,
            pid,
            log_path,
            status: status_rx,
            kill_switch,
        })
    }
}
