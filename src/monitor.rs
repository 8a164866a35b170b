//! Liveness polling of every (engine, match) pair.
//!
//! Liveness is sampled every tick; the heartbeat summary is printed on its own, coarser
//! period. The monitor only reads state: stopping anything is left to the orchestrator.

use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::engine::EngineInstance;
use crate::logger::wall_clock;
use crate::match_runner::{MatchState, MatchTask};

/// An instance still has work to do while its engine lives and its match is not over.
pub fn is_active(process_alive: bool, match_done: bool) -> bool {
    process_alive && !match_done
}

/// One instance, as seen by one liveness tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Engine port.
    pub port: u16,
    /// Engine process not reaped yet.
    pub alive: bool,
    /// State of the match bound to that engine.
    pub match_state: MatchState,
}

impl Sample {
    /// See [`is_active`].
    pub fn is_active(&self) -> bool {
        is_active(self.alive, self.match_state.is_done())
    }
}

/// Sample every pair. Engines and matches are zipped by position.
pub fn sample(engines: &[EngineInstance], matches: &[MatchTask]) -> Vec<Sample> {
    debug_assert_eq!(engines.len(), matches.len(), "partially built experiment");
    engines
        .iter()
        .zip(matches)
        .map(|(engine, task)| Sample {
            port: engine.port(),
            alive: engine.is_alive(),
            match_state: task.state(),
        })
        .collect()
}

/// Poll until no instance is active.
pub async fn monitor(
    engines: &[EngineInstance],
    matches: &[MatchTask],
    tick: Duration,
    heartbeat: Duration,
    verbose: bool,
) {
    poll_until_idle(|| sample(engines, matches), tick, heartbeat, verbose).await;
}

async fn poll_until_idle<F>(
    mut sample: F,
    tick: Duration,
    heartbeat: Duration,
    verbose: bool,
) -> usize
where
    F: FnMut() -> Vec<Sample>,
{
    let mut ticker = interval(tick.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heartbeat = Instant::now();
    let mut ticks = 0;

    loop {
        ticker.tick().await;
        ticks += 1;
        let samples = sample();
        let active = samples.iter().filter(|s| s.is_active()).count();
        debug!(active, total = samples.len(), "liveness tick");

        if active == 0 {
            break;
        }

        if last_heartbeat.elapsed() >= heartbeat {
            last_heartbeat = Instant::now();
            info!(active, total = samples.len(), "heartbeat");
            if verbose {
                for line in render_heartbeat(&wall_clock(), &samples, true) {
                    println!("{line}");
                }
            }
        }
    }

    info!("all executions are closed");
    ticks
}

/// Console lines of one heartbeat: clock, one status per port, then one line per match.
pub(crate) fn render_heartbeat(clock: &str, samples: &[Sample], color: bool) -> Vec<String> {
    const RED: &str = "\x1b[31m";
    const GREEN: &str = "\x1b[32m";
    const RESET: &str = "\x1b[39m";

    let ports = samples
        .iter()
        .map(|s| {
            let (label, paint) = if s.is_active() {
                ("ACTIVE", GREEN)
            } else {
                ("DEAD  ", RED)
            };
            if color {
                format!("Port: {} - {paint}{label}{RESET}", s.port)
            } else {
                format!("Port: {} - {label}", s.port)
            }
        })
        .collect::<Vec<_>>()
        .join(" | ");

    let mut lines = vec![clock.to_owned(), ports];
    lines.extend(
        samples
            .iter()
            .map(|s| format!("Match on {}: {}", s.port, s.match_state)),
    );
    lines
}
