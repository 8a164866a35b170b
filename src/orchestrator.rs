//! Top-level experiment logic.
//!
//! The [`Orchestrator`] walks through the phases of one experiment:
//!
//! 1. [`Phase::Allocating`]: find up to `engine_count` bindable ports. A shortfall only
//!    shrinks the experiment.
//! 2. [`Phase::Spawning`]: start one engine and its log tail per port.
//! 3. [`Phase::AwaitingReady`]: wait, bounded by the readiness timeout, until every
//!    engine printed its readiness marker. Anything short of that aborts the run and no
//!    match is ever started.
//! 4. [`Phase::Running`]: bind a gateway and two fresh agents to every engine and start
//!    one match per engine.
//! 5. [`Phase::Monitoring`]: poll liveness until nothing is active, bounded by the
//!    global deadline.
//! 6. [`Phase::Teardown`]: kill every engine still running and join every task. Reached
//!    from every earlier phase, and runs once.
//!
//! The outcome and the final state of every instance are returned as an
//! [`ExperimentReport`].

use std::fmt::Display;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, trace, warn};

use crate::configuration::ExperimentConfig;
use crate::engine::{kill_all, EngineInstance, Markers, ProcessState, Supervisor};
use crate::game_interface::{Gateway, GatewayFactory};
use crate::match_runner::{GatewayBinding, Lineup, MatchState, MatchTask};
use crate::monitor::monitor;
use crate::port_allocator;

/// States of the experiment, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Looking for free ports.
    Allocating,
    /// Starting engines.
    Spawning,
    /// Waiting for every engine to be ready.
    AwaitingReady,
    /// Starting matches.
    Running,
    /// Polling liveness.
    Monitoring,
    /// Killing and joining everything.
    Teardown,
    /// Over.
    Done,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Allocating => "ALLOCATING",
            Phase::Spawning => "SPAWNING",
            Phase::AwaitingReady => "AWAITING_READY",
            Phase::Running => "RUNNING",
            Phase::Monitoring => "MONITORING",
            Phase::Teardown => "TEARDOWN",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// How the experiment ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every instance stopped being active before the global deadline.
    Completed,
    /// The global deadline expired while monitoring.
    DeadlineExceeded(Duration),
    /// These engines did not report readiness in time. No match was started.
    NotReady(Vec<u16>),
    /// An engine could not be started. No match was started.
    SpawnFailed {
        /// Port the engine was meant for.
        port: u16,
        /// Cause of the failure.
        reason: String,
    },
}

impl Outcome {
    /// Only [`Outcome::Completed`] counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::DeadlineExceeded(deadline) => {
                write!(f, "global deadline of {}s exceeded", deadline.as_secs())
            }
            Outcome::NotReady(ports) => write!(f, "engines not ready: {ports:?}"),
            Outcome::SpawnFailed { port, reason } => {
                write!(f, "could not start engine on port {port}: {reason}")
            }
        }
    }
}

/// Final state of one engine and its match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    /// Engine port.
    pub port: u16,
    /// Engine process id.
    pub pid: Option<u32>,
    /// Whether the readiness marker was seen.
    pub ready: bool,
    /// Line that got the engine killed.
    pub fatal: Option<String>,
    /// Exit status of the engine.
    pub process: ProcessState,
    /// `None` when no match was started.
    pub match_state: Option<MatchState>,
    /// Engine log file.
    pub log_path: PathBuf,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentReport {
    /// How the experiment ended.
    pub outcome: Outcome,
    /// Every phase entered, in order.
    pub phases: Vec<Phase>,
    /// One row per spawned engine, in port order.
    pub instances: Vec<InstanceReport>,
}

impl ExperimentReport {
    /// See [`Outcome::is_success`].
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Row of the engine on `port`.
    pub fn instance(&self, port: u16) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.port == port)
    }
}

/// Owns everything started during an experiment.
///
/// Engines and matches are zipped by position. Dropping a fleet that was not torn down
/// kills the engines and aborts the remaining tasks.
#[derive(Default)]
struct Fleet {
    engines: Vec<EngineInstance>,
    matches: Vec<MatchTask>,
    tails: JoinSet<()>,
    match_tasks: JoinSet<()>,
    torn_down: bool,
}

impl Fleet {
    async fn teardown(&mut self, grace: Duration) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let failures = kill_all(&self.engines);
        if !failures.is_empty() {
            warn!(count = failures.len(), "some engines could not be killed");
        }

        let drained = timeout(grace, async {
            while self.tails.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "log tails still running, aborting them");
            self.tails.shutdown().await;
        }
        self.match_tasks.shutdown().await;
        trace!("fleet torn down");
    }

    fn report(&self) -> Vec<InstanceReport> {
        self.engines
            .iter()
            .enumerate()
            .map(|(index, engine)| {
                let status = engine.status();
                InstanceReport {
                    port: engine.port(),
                    pid: engine.pid(),
                    ready: status.ready,
                    fatal: status.fatal,
                    process: status.process,
                    match_state: self.matches.get(index).map(MatchTask::state),
                    log_path: engine.log_path().to_owned(),
                }
            })
            .collect()
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        if !self.torn_down {
            kill_all(&self.engines);
        }
    }
}

/// Runs experiments, creating one gateway per engine with `F`.
///
/// # Type Parameters
/// - `G`: The gateway type implementing [`Gateway`]
/// - `F`: A factory implementing [`GatewayFactory<G>`]
pub struct Orchestrator<G: Gateway, F>
where
    F: GatewayFactory<G>,
{
    factory: F,
    config: ExperimentConfig,
    markers: Markers,
    _gateway: PhantomData<G>,
}

impl<G: Gateway, F: GatewayFactory<G>> Orchestrator<G, F> {
    /// Create an [`Orchestrator`] with given [`ExperimentConfig`] and [`GatewayFactory`]
    pub fn new(factory: F, config: ExperimentConfig) -> Orchestrator<G, F> {
        trace!(?config);
        Orchestrator {
            factory,
            config,
            markers: Markers::default(),
            _gateway: PhantomData,
        }
    }

    /// Look for other readiness and fatal markers in the engine output.
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    /// Configuration of the experiments.
    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run one experiment, with agents taken from `lineup`.
    ///
    /// Every engine is dead and every task joined when this returns.
    ///
    /// # Errors
    /// Only when the experiment cannot be set up at all. Failures of engines and matches
    /// are reported in the [`ExperimentReport`].
    #[instrument(skip_all, fields(experiment = %self.config.experiment_name))]
    pub async fn run(&self, lineup: &Lineup) -> anyhow::Result<ExperimentReport> {
        let mut phases = Vec::new();
        let supervisor = Supervisor::new(&self.config)?.with_markers(self.markers.clone());

        enter(&mut phases, Phase::Allocating);
        let ports = self.allocate_ports();

        let mut fleet = Fleet::default();
        let outcome = self.drive(&supervisor, &ports, lineup, &mut fleet, &mut phases).await;

        enter(&mut phases, Phase::Teardown);
        fleet.teardown(self.config.teardown_grace).await;
        let instances = fleet.report();
        enter(&mut phases, Phase::Done);

        match &outcome {
            Outcome::Completed => info!(%outcome, "experiment over"),
            _ => error!(%outcome, "experiment aborted"),
        }
        Ok(ExperimentReport {
            outcome,
            phases,
            instances,
        })
    }

    fn allocate_ports(&self) -> Vec<u16> {
        let requested = self.config.engine_count;
        let physical = num_cpus::get_physical();
        if requested > physical {
            warn!(requested, physical, "more engines than physical cores");
        }

        let ports =
            port_allocator::allocate(self.config.port_start, self.config.port_end, requested);
        if ports.len() < requested {
            warn!(
                requested,
                found = ports.len(),
                "not enough free ports, running fewer engines"
            );
        }
        info!(?ports, "ports allocated");
        ports
    }

    async fn drive(
        &self,
        supervisor: &Supervisor,
        ports: &[u16],
        lineup: &Lineup,
        fleet: &mut Fleet,
        phases: &mut Vec<Phase>,
    ) -> Outcome {
        let config = &self.config;

        enter(phases, Phase::Spawning);
        for &port in ports {
            match supervisor.spawn(port, &mut fleet.tails).await {
                Ok(engine) => fleet.engines.push(engine),
                Err(e) => {
                    error!(port, "{e:#}");
                    return Outcome::SpawnFailed {
                        port,
                        reason: format!("{e:#}"),
                    };
                }
            }
        }

        enter(phases, Phase::AwaitingReady);
        if config.verbose {
            println!("Waiting for {} engine(s) to be ready...", fleet.engines.len());
        }
        let all_ready = timeout(config.ready_timeout, async {
            for engine in &fleet.engines {
                if !engine.wait_ready().await {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false);
        if !all_ready {
            let pending = fleet
                .engines
                .iter()
                .filter(|e| !e.is_ready())
                .map(EngineInstance::port)
                .collect::<Vec<_>>();
            error!(?pending, timeout = ?config.ready_timeout, "engines not ready, aborting");
            if config.verbose {
                println!("\x1b[31mEngines not ready: {pending:?}. Aborting.\x1b[39m");
            }
            kill_all(&fleet.engines);
            return Outcome::NotReady(pending);
        }

        enter(phases, Phase::Running);
        sleep(config.match_start_delay).await;
        for (index, engine) in fleet.engines.iter().enumerate() {
            let port = engine.port();
            let gateway = self.factory.new_gateway(port);
            let binding =
                GatewayBinding::new(port, gateway, lineup, &config.experiment_name, index);
            let task = MatchTask::start(binding, config.games_per_instance, &mut fleet.match_tasks);
            if config.verbose {
                println!("Match {} started on port {port}.", task.name());
            }
            fleet.matches.push(task);
        }

        enter(phases, Phase::Monitoring);
        let deadline = config.global_deadline();
        let monitoring = monitor(
            &fleet.engines,
            &fleet.matches,
            config.liveness_tick,
            config.poll_interval(),
            config.verbose,
        );
        match timeout(deadline, monitoring).await {
            Ok(()) => Outcome::Completed,
            Err(_) => {
                error!(?deadline, "global deadline exceeded");
                Outcome::DeadlineExceeded(deadline)
            }
        }
    }
}

fn enter(phases: &mut Vec<Phase>, phase: Phase) {
    info!(%phase, "entering phase");
    phases.push(phase);
}

/// Console summary: a closing line, one line per port with the engine exit status, then
/// the outcome.
///
/// `color` adds ANSI escapes; leave it off when stdout is not a terminal.
pub fn print_report(report: &ExperimentReport, color: bool) {
    for line in render_report(report, color) {
        println!("{line}");
    }
}

fn render_report(report: &ExperimentReport, color: bool) -> Vec<String> {
    let (green, red, reset) = if color {
        ("\x1b[32m", "\x1b[31m", "\x1b[39m")
    } else {
        ("", "", "")
    };

    let mut lines = vec!["All executions are closed".to_owned()];
    for instance in &report.instances {
        let clean = matches!(instance.process, ProcessState::Exited(s) if s.success());
        let paint = if clean { green } else { red };
        let mut line = format!("Port: {} - {paint}{}{reset}", instance.port, instance.process);
        if let Some(state) = &instance.match_state {
            line.push_str(&format!(" (match {state})"));
        }
        if let Some(fatal) = &instance.fatal {
            line.push_str(&format!(" {red}[{fatal}]{reset}"));
        }
        lines.push(line);
    }
    let paint = if report.is_success() { green } else { red };
    lines.push(format!("Outcome: {paint}{}{reset}", report.outcome));
    lines
}
