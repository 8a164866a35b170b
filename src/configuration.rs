//! Experiment-wide settings.
//!
//! An [`ExperimentConfig`] is built once at startup and handed to every component by
//! reference. Nothing reads settings from ambient state after that point.
//!
//! Configuration can be created programmatically using [`ExperimentConfig::new()`] or by
//! reading environment variables using [`ExperimentConfig::from_env()`], then refined with
//! the `with_*` methods (the binary applies its command line flags this way).
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive and enabled by `"true"`.
//!
//! - `FTG_JAVA`: Java launcher used to start the engine (default: `java`)
//! - `FTG_ENGINE_DIR`: Working directory of the engine processes (default: `.`)
//! - `FTG_LOG_ROOT`: Root directory of the per-instance log files (default: `log/engines`)
//! - `FTG_VERBOSE`: Print heartbeats and the final report to stdout (default: `true`)
//! - `FTG_LOG`: Write the orchestrator trace to a file instead of stderr (default: `false`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineCommand;

/// Settings of one experiment run.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub(crate) engine_count: usize,
    pub(crate) games_per_instance: u32,
    pub(crate) player_hit_points: u32,
    pub(crate) poll_interval_seconds: u64,
    pub(crate) game_duration_seconds: u64,
    pub(crate) experiment_name: String,
    pub(crate) port_start: u16,
    pub(crate) port_end: u16,
    pub(crate) log_root: PathBuf,
    pub(crate) java: String,
    pub(crate) engine_dir: PathBuf,
    pub(crate) engine_command: Option<EngineCommand>,
    pub(crate) ready_timeout: Duration,
    pub(crate) liveness_tick: Duration,
    pub(crate) match_start_delay: Duration,
    pub(crate) teardown_grace: Duration,
    pub(crate) verbose: bool,
    pub(crate) log: bool,
}

impl ExperimentConfig {
    /// Multiplier applied to the nominal experiment length to get the global deadline.
    pub const DEADLINE_FACTOR: u64 = 5;

    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - One engine, one game per engine, 400 hit points, 60 s games.
    /// - A heartbeat every 10 s, liveness sampled every second.
    /// - Ports are looked up in `8000..=9000`.
    /// - Engines get 30 s to report readiness, then matches start 3 s later.
    /// - Logs of each engine go under `log/engines/<experiment>/`.
    pub fn new() -> Self {
        Self {
            engine_count: 1,
            games_per_instance: 1,
            player_hit_points: 400,
            poll_interval_seconds: 10,
            game_duration_seconds: 60,
            experiment_name: "adhoc".to_owned(),
            port_start: 8000,
            port_end: 9000,
            log_root: PathBuf::from("log/engines"),
            java: "java".to_owned(),
            engine_dir: PathBuf::from("."),
            engine_command: None,
            ready_timeout: Duration::from_secs(30),
            liveness_tick: Duration::from_secs(1),
            match_start_delay: Duration::from_secs(3),
            teardown_grace: Duration::from_secs(5),
            verbose: true,
            log: false,
        }
    }

    /// Create configuration from environment variables, on top of [`ExperimentConfig::new()`].
    ///
    /// See the [module documentation](self) for the recognized variables.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let mut config = Self::new();
        if let Ok(java) = std::env::var("FTG_JAVA") {
            config.java = java;
        }
        if let Ok(dir) = std::env::var("FTG_ENGINE_DIR") {
            config.engine_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("FTG_LOG_ROOT") {
            config.log_root = PathBuf::from(root);
        }
        config.verbose = get_env_flag("FTG_VERBOSE", config.verbose);
        config.log = get_env_flag("FTG_LOG", config.log);
        config
    }

    /// Number of engine instances to run at once.
    pub fn with_engine_count(mut self, value: usize) -> Self {
        self.engine_count = value;
        self
    }

    /// Number of games each engine instance plays.
    pub fn with_games_per_instance(mut self, value: u32) -> Self {
        self.games_per_instance = value;
        self
    }

    /// Hit points of both players.
    pub fn with_player_hit_points(mut self, value: u32) -> Self {
        self.player_hit_points = value;
        self
    }

    /// Seconds between two heartbeat summaries.
    pub fn with_poll_interval_seconds(mut self, value: u64) -> Self {
        self.poll_interval_seconds = value;
        self
    }

    /// Maximum duration of one game, in seconds.
    pub fn with_game_duration_seconds(mut self, value: u64) -> Self {
        self.game_duration_seconds = value;
        self
    }

    /// Name used for log directories and match names.
    pub fn with_experiment_name(mut self, value: impl Into<String>) -> Self {
        self.experiment_name = value.into();
        self
    }

    /// Inclusive range scanned by the port allocator.
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_start = start;
        self.port_end = end;
        self
    }

    /// Root directory of the per-instance engine logs.
    pub fn with_log_root(mut self, value: impl Into<PathBuf>) -> Self {
        self.log_root = value.into();
        self
    }

    /// Java launcher used by the default engine command.
    pub fn with_java(mut self, value: impl Into<String>) -> Self {
        self.java = value.into();
        self
    }

    /// Working directory of the default engine command.
    pub fn with_engine_dir(mut self, value: impl Into<PathBuf>) -> Self {
        self.engine_dir = value.into();
        self
    }

    /// Replace the engine command entirely. `--port <N>` is still appended per instance.
    pub fn with_engine_command(mut self, command: EngineCommand) -> Self {
        self.engine_command = Some(command);
        self
    }

    /// Bound on the wait for every engine to report readiness.
    pub fn with_ready_timeout(mut self, value: Duration) -> Self {
        self.ready_timeout = value;
        self
    }

    /// Period of the liveness sampling loop.
    pub fn with_liveness_tick(mut self, value: Duration) -> Self {
        self.liveness_tick = value;
        self
    }

    /// Pause between the readiness gate and the first match.
    pub fn with_match_start_delay(mut self, value: Duration) -> Self {
        self.match_start_delay = value;
        self
    }

    /// How long teardown waits for log tails to drain after killing the engines.
    pub fn with_teardown_grace(mut self, value: Duration) -> Self {
        self.teardown_grace = value;
        self
    }

    /// Enable or disable console output.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Number of engines requested.
    pub fn engine_count(&self) -> usize {
        self.engine_count
    }

    /// Number of games per engine.
    pub fn games_per_instance(&self) -> u32 {
        self.games_per_instance
    }

    /// Name of the experiment.
    pub fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    /// Inclusive range scanned by the port allocator.
    pub fn port_range(&self) -> (u16, u16) {
        (self.port_start, self.port_end)
    }

    /// Whether console output is enabled.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Directory holding the engine logs of this experiment.
    pub fn experiment_log_dir(&self) -> PathBuf {
        self.log_root.join(&self.experiment_name)
    }

    /// Root directory of all engine logs.
    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    /// Heartbeat period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Hard limit for the whole monitoring phase:
    /// `game_duration_seconds × games_per_instance × 5`.
    pub fn global_deadline(&self) -> Duration {
        Duration::from_secs(
            self.game_duration_seconds
                .saturating_mul(u64::from(self.games_per_instance))
                .saturating_mul(Self::DEADLINE_FACTOR),
        )
    }

    /// The engine command, either the one set with [`Self::with_engine_command`] or the
    /// FightingICE command derived from this configuration.
    pub fn engine_command(&self) -> EngineCommand {
        match &self.engine_command {
            Some(command) => command.clone(),
            None => EngineCommand::fighting_ice(
                &self.java,
                &self.engine_dir,
                self.player_hit_points,
                self.game_duration_seconds,
            ),
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self::new()
    }
}
