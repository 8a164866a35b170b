#![cfg(unix)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ftg_runner::engine::ProcessState;
use ftg_runner::orchestrator::Phase;
use ftg_runner::prelude::*;
use tempfile::TempDir;

#[derive(Clone)]
enum Play {
    /// Every game is played at once.
    Finish,
    /// Never returns.
    Hang,
    /// Creates `<dir>/done-<port>` to let the engine exit, then never returns.
    Release(PathBuf),
}

struct FakeGateway {
    port: u16,
    play: Play,
    agents: Vec<String>,
}

#[async_trait]
impl Gateway for FakeGateway {
    fn register_agent(&mut self, name: &str, _agent: Box<dyn Agent>) {
        self.agents.push(name.to_owned());
    }

    async fn run_match(
        &mut self,
        _roster: &[String],
        agents: &[String; 2],
        _games: u32,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(agents.as_slice() == self.agents.as_slice(), "unexpected agents");
        match &self.play {
            Play::Finish => Ok(()),
            Play::Hang => std::future::pending().await,
            Play::Release(dir) => {
                std::fs::write(dir.join(format!("done-{}", self.port)), "")?;
                std::future::pending().await
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct FakeFactory {
    play: Play,
    created: Arc<AtomicUsize>,
}

impl FakeFactory {
    fn new(play: Play) -> Self {
        Self {
            play,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl GatewayFactory<FakeGateway> for FakeFactory {
    fn new_gateway(&self, port: u16) -> FakeGateway {
        self.created.fetch_add(1, Ordering::SeqCst);
        FakeGateway {
            port,
            play: self.play.clone(),
            agents: vec![],
        }
    }
}

/// Engine played by `sh -c <script> engine --port <N>`, so the port is `$2`.
fn config(logs: &Path, ports: (u16, u16), engines: usize, script: &str) -> ExperimentConfig {
    ExperimentConfig::new()
        .with_verbose(false)
        .with_log_root(logs)
        .with_experiment_name("it")
        .with_port_range(ports.0, ports.1)
        .with_engine_count(engines)
        .with_games_per_instance(1)
        .with_game_duration_seconds(4)
        .with_ready_timeout(Duration::from_secs(5))
        .with_liveness_tick(Duration::from_millis(50))
        .with_match_start_delay(Duration::ZERO)
        .with_teardown_grace(Duration::from_secs(2))
        .with_engine_command(EngineCommand::new("sh", ["-c", script, "engine"]))
}

fn log_files(logs: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(logs.join("it"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .collect()
}

fn assert_all_dead(report: &ExperimentReport) {
    for instance in &report.instances {
        assert!(
            matches!(instance.process, ProcessState::Exited(_)),
            "engine on {} still {:?}",
            instance.port,
            instance.process
        );
    }
}

#[tokio::test]
async fn two_engines_two_matches() {
    let logs = TempDir::new().unwrap();
    let config = config(
        logs.path(),
        (19100, 19199),
        2,
        r#"echo "Waiting to launch a game"; sleep 30"#,
    );
    let factory = FakeFactory::new(Play::Finish);
    let report = Orchestrator::new(factory.clone(), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(
        report.phases,
        [
            Phase::Allocating,
            Phase::Spawning,
            Phase::AwaitingReady,
            Phase::Running,
            Phase::Monitoring,
            Phase::Teardown,
            Phase::Done,
        ]
    );
    assert_eq!(factory.created(), 2);
    assert_eq!(report.instances.len(), 2);
    assert_ne!(report.instances[0].port, report.instances[1].port);
    for instance in &report.instances {
        assert!(instance.ready);
        assert_eq!(instance.match_state, Some(MatchState::Succeeded));
        assert!(instance.log_path.exists());
    }
    assert_eq!(log_files(logs.path()).len(), 2);
    assert_all_dead(&report);
}

#[tokio::test]
async fn fatal_line_only_kills_its_engine() {
    let logs = TempDir::new().unwrap();
    let lock = logs.path().join("lock");
    let script = format!(
        r#"echo "Waiting to launch a game"
if mkdir "{}" 2>/dev/null
then sleep 1; echo "java.lang.Error: boom"; sleep 30
else sleep 2; exit 0
fi"#,
        lock.display()
    );
    let config = config(logs.path(), (19200, 19299), 2, &script);
    let report = Orchestrator::new(FakeFactory::new(Play::Hang), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    let (fatal, healthy): (Vec<_>, Vec<_>) =
        report.instances.iter().partition(|i| i.fatal.is_some());
    assert_eq!(fatal.len(), 1);
    assert_eq!(healthy.len(), 1);

    assert_eq!(fatal[0].fatal.as_deref(), Some("java.lang.Error: boom"));
    match fatal[0].process {
        ProcessState::Exited(status) => assert_eq!(status.code(), None),
        other => panic!("unexpected {other:?}"),
    }
    match healthy[0].process {
        ProcessState::Exited(status) => assert_eq!(status.code(), Some(0)),
        other => panic!("unexpected {other:?}"),
    }
    for instance in &report.instances {
        assert_eq!(instance.match_state, Some(MatchState::Cancelled));
    }
}

#[tokio::test]
async fn readiness_timeout_aborts_before_any_match() {
    let logs = TempDir::new().unwrap();
    let config = config(logs.path(), (19300, 19399), 2, "echo booting; sleep 30")
        .with_ready_timeout(Duration::from_millis(500));
    let factory = FakeFactory::new(Play::Finish);
    let report = Orchestrator::new(factory.clone(), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    let ports = report.instances.iter().map(|i| i.port).collect::<Vec<_>>();
    assert_eq!(report.outcome, Outcome::NotReady(ports));
    assert_eq!(factory.created(), 0);
    assert!(!report.phases.contains(&Phase::Running));
    assert!(!report.phases.contains(&Phase::Monitoring));
    assert_eq!(report.phases.last(), Some(&Phase::Done));
    for instance in &report.instances {
        assert!(!instance.ready);
        assert_eq!(instance.match_state, None);
    }
    assert_all_dead(&report);
}

#[tokio::test]
async fn engine_exiting_before_ready_aborts() {
    let logs = TempDir::new().unwrap();
    let config = config(logs.path(), (19400, 19499), 1, "echo 'no main class'; exit 1")
        .with_ready_timeout(Duration::from_secs(30));
    let factory = FakeFactory::new(Play::Finish);
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        Orchestrator::new(factory.clone(), config).run(&Lineup::default()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(report.outcome, Outcome::NotReady(ref ports) if ports.len() == 1));
    assert_eq!(factory.created(), 0);
    match report.instances[0].process {
        ProcessState::Exited(status) => assert_eq!(status.code(), Some(1)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn report_keeps_real_exit_codes() {
    let logs = TempDir::new().unwrap();
    let dir = logs.path().join("release");
    std::fs::create_dir(&dir).unwrap();
    let script = format!(
        r#"echo "Waiting to launch a game"
while [ ! -e "{dir}/done-$2" ]; do sleep 0.05; done
exit 3"#,
        dir = dir.display()
    );
    let config = config(logs.path(), (19500, 19599), 2, &script);
    let report = Orchestrator::new(FakeFactory::new(Play::Release(dir)), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.instances.len(), 2);
    for instance in &report.instances {
        // the engine going away is what ended the match
        assert_eq!(instance.match_state, Some(MatchState::Cancelled));
        match instance.process {
            ProcessState::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn engine_exit_ends_monitoring_despite_open_output() {
    let logs = TempDir::new().unwrap();
    let config = config(
        logs.path(),
        (19800, 19899),
        1,
        r#"echo "Waiting to launch a game"; sleep 60 & sleep 0.3; exit 3"#,
    )
    .with_game_duration_seconds(2);
    let started = std::time::Instant::now();
    let report = Orchestrator::new(FakeFactory::new(Play::Hang), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert!(started.elapsed() < Duration::from_secs(8));
    match report.instances[0].process {
        ProcessState::Exited(status) => assert_eq!(status.code(), Some(3)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn global_deadline_stops_stalled_matches() {
    let logs = TempDir::new().unwrap();
    let config = config(
        logs.path(),
        (19600, 19699),
        1,
        r#"echo "Waiting to launch a game"; sleep 30"#,
    )
    .with_game_duration_seconds(1);
    let report = Orchestrator::new(FakeFactory::new(Play::Hang), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        Outcome::DeadlineExceeded(Duration::from_secs(5))
    );
    assert!(!report.is_success());
    assert_eq!(report.instances[0].match_state, Some(MatchState::Cancelled));
    assert_all_dead(&report);
}

#[tokio::test]
async fn missing_engine_is_a_spawn_failure() {
    let logs = TempDir::new().unwrap();
    let config = config(logs.path(), (19700, 19799), 2, "true")
        .with_engine_command(EngineCommand::new("/nonexistent/engine", ["--headless-mode"]));
    let factory = FakeFactory::new(Play::Finish);
    let report = Orchestrator::new(factory.clone(), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert!(matches!(report.outcome, Outcome::SpawnFailed { .. }));
    assert!(report.instances.is_empty());
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn no_free_port_means_empty_experiment() {
    let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = held.local_addr().unwrap().port();
    let logs = TempDir::new().unwrap();
    let config = config(logs.path(), (port, port), 3, "sleep 30");
    let factory = FakeFactory::new(Play::Finish);
    let report = Orchestrator::new(factory.clone(), config)
        .run(&Lineup::default())
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert!(report.instances.is_empty());
    assert_eq!(factory.created(), 0);
}
