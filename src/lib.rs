//! # FTG Runner
//!
//! Runs reproducible AI-vs-AI experiments against several instances of an external
//! fighting game engine at once, and tears everything down cleanly whether the run
//! finishes, stalls or errors.
//!
//! It provides:
//! - Port allocation for the engines (`port_allocator`)
//! - Engine supervision: log files, readiness and fatal markers, process tree kill
//!   ([`engine`])
//! - One match per engine, played through a pluggable [`Gateway`](crate::game_interface::Gateway)
//! - Liveness polling with a periodic console heartbeat ([`monitor`])
//! - The experiment state machine, bounded by a readiness timeout and a global deadline
//!   ([`orchestrator`])
//!
//! The whole experiment runs on a single thread: engine output, gateway sockets and
//! polling are multiplexed on one tokio runtime.
//!
//! # Documentation Overview
//!
//! - For the phases of an experiment and what ends it, see the [`orchestrator`] module.
//! - For tuning the experiment, see [`ExperimentConfig`](crate::configuration::ExperimentConfig).
//! - For plugging in another transport or other agents, check out the
//!   [`Gateway`](crate::game_interface::Gateway),
//!   [`GatewayFactory`](crate::game_interface::GatewayFactory) and
//!   [`Agent`](crate::game_interface::Agent) traits.
//!
//! # Usage Example
//!
//! ```no_run
//! use ftg_runner::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ExperimentConfig::from_env()
//!         .with_engine_count(2)
//!         .with_games_per_instance(3)
//!         .with_experiment_name("kick-vs-idle");
//!
//!     let orchestrator = Orchestrator::new(LineGatewayFactory::default(), config);
//!     let report = orchestrator.run(&Lineup::default()).await?;
//!
//!     print_report(&report, true);
//!     if !report.is_success() {
//!         std::process::exit(1);
//!     }
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub use anyhow;
pub mod agent;
pub mod configuration;
pub mod engine;
pub mod game_interface;
pub mod logger;
pub mod match_runner;
pub mod monitor;
pub mod orchestrator;
pub mod port_allocator;
pub mod tcp_gateway;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use ftg_runner::prelude::*;
/// ```
///
/// Includes:
/// - [`ExperimentConfig`](crate::configuration::ExperimentConfig)
/// - [`Orchestrator`](crate::orchestrator::Orchestrator) and its report types
/// - the [`Gateway`](crate::game_interface::Gateway) traits and the built-in
///   [`LineGatewayFactory`](crate::tcp_gateway::LineGatewayFactory)
/// - the built-in agents and [`Lineup`](crate::match_runner::Lineup)
pub mod prelude {
    pub use crate::agent::{DisplayInfoAgent, KickAgent};
    pub use crate::configuration::ExperimentConfig;
    pub use crate::engine::{EngineCommand, Markers};
    pub use crate::game_interface::{Agent, Gateway, GatewayFactory};
    pub use crate::match_runner::{Lineup, MatchState};
    pub use crate::orchestrator::{print_report, ExperimentReport, Orchestrator, Outcome};
    pub use crate::tcp_gateway::{LineGateway, LineGatewayFactory};
}
