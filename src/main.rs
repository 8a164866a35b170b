use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ftg_runner::logger::init_logger;
use ftg_runner::prelude::*;
use tracing::info;

/// Value meaning "keep the built-in default" for the numeric flags.
const UNSET: i64 = -1;

#[derive(Parser, Debug)]
#[command(
    name = "ftg-runner",
    version,
    about = "FightingICE Research Runner",
    allow_negative_numbers = true
)]
struct Cli {
    /// Hit points of both players
    #[arg(
        short = 'p',
        long,
        default_value_t = UNSET,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    player_hit_points: i64,

    /// Seconds between two heartbeat summaries
    #[arg(
        short = 'i',
        long = "poll-interval-sec",
        default_value_t = UNSET,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    poll_interval: i64,

    /// Number of engine instances
    #[arg(
        short = 'e',
        long,
        default_value_t = UNSET,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    engine_count: i64,

    /// Number of games played on every engine
    #[arg(
        short = 'g',
        long = "no-games",
        default_value_t = UNSET,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    games: i64,

    /// Maximum duration of one game, in seconds
    #[arg(
        short = 'd',
        long,
        default_value_t = UNSET,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    game_duration: i64,

    /// Experiment name, used for log directories and match names
    #[arg(short = 'x', long, default_value = "adhoc")]
    game_name: String,

    /// First port tried by the allocator
    #[arg(long)]
    port_start: Option<u16>,

    /// Last port tried by the allocator
    #[arg(long)]
    port_end: Option<u16>,

    /// Directory holding the engine jar files
    #[arg(long)]
    engine_dir: Option<PathBuf>,

    /// Java launcher
    #[arg(long)]
    java: Option<String>,

    /// No heartbeat or report on stdout
    #[arg(long)]
    quiet: bool,

    /// Write the orchestrator trace to a file
    #[arg(long)]
    log: bool,
}

fn explicit<T: TryFrom<i64>>(value: i64, flag: &str) -> anyhow::Result<Option<T>> {
    if value == UNSET {
        return Ok(None);
    }
    T::try_from(value)
        .map(Some)
        .map_err(|_| anyhow::anyhow!("{flag} is out of range: {value}"))
}

impl Cli {
    fn apply(&self, mut config: ExperimentConfig) -> anyhow::Result<ExperimentConfig> {
        if let Some(hp) = explicit(self.player_hit_points, "--player-hit-points")? {
            config = config.with_player_hit_points(hp);
        }
        if let Some(seconds) = explicit(self.poll_interval, "--poll-interval-sec")? {
            config = config.with_poll_interval_seconds(seconds);
        }
        if let Some(count) = explicit(self.engine_count, "--engine-count")? {
            config = config.with_engine_count(count);
        }
        if let Some(games) = explicit(self.games, "--no-games")? {
            config = config.with_games_per_instance(games);
        }
        if let Some(seconds) = explicit(self.game_duration, "--game-duration")? {
            config = config.with_game_duration_seconds(seconds);
        }
        config = config.with_experiment_name(self.game_name.clone());

        if self.port_start.is_some() || self.port_end.is_some() {
            let (start, end) = config.port_range();
            let start = self.port_start.unwrap_or(start);
            let end = self.port_end.unwrap_or(end);
            anyhow::ensure!(start <= end, "empty port range {start}..={end}");
            config = config.with_port_range(start, end);
        }
        if let Some(dir) = &self.engine_dir {
            config = config.with_engine_dir(dir);
        }
        if let Some(java) = &self.java {
            config = config.with_java(java);
        }
        if self.quiet {
            config = config.with_verbose(false);
        }
        if self.log {
            config = config.with_log(true);
        }
        Ok(config)
    }
}

/// Console line announcing the engine command, silenced by `--quiet`.
fn command_banner(config: &ExperimentConfig) -> Option<String> {
    config
        .verbose()
        .then(|| format!("Engine command: {}", config.engine_command()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.apply(ExperimentConfig::from_env())?;
    init_logger(&config).context("could not set up logging")?;

    info!(command = %config.engine_command(), "engine command");
    if let Some(banner) = command_banner(&config) {
        println!("{banner}");
    }

    let verbose = config.verbose();
    let orchestrator = Orchestrator::new(LineGatewayFactory::default(), config);
    let report = orchestrator.run(&Lineup::default()).await?;
    if verbose {
        print_report(&report, std::io::stdout().is_terminal());
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
