//! Gateway bindings and the concurrent match tasks that drive them.

use std::fmt::Display;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::agent::{DisplayInfoAgent, KickAgent};
use crate::game_interface::{Agent, Gateway};

/// Builds a fresh agent for every binding.
pub type AgentMaker = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Who plays, and with which character, on every engine instance.
#[derive(Clone)]
pub struct Lineup {
    character: String,
    first: AgentMaker,
    second: AgentMaker,
}

impl Lineup {
    /// Both players use `character`; agents come from `first` and `second`.
    pub fn new<A, B>(character: impl Into<String>, first: A, second: B) -> Self
    where
        A: Fn() -> Box<dyn Agent> + Send + Sync + 'static,
        B: Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    {
        Self {
            character: character.into(),
            first: Arc::new(first),
            second: Arc::new(second),
        }
    }

    /// Character used by both players.
    pub fn character(&self) -> &str {
        &self.character
    }
}

impl Default for Lineup {
    /// `KickAI` against `DisplayInfo`, both on `ZEN`.
    fn default() -> Self {
        Self::new(
            "ZEN",
            || Box::new(KickAgent) as Box<dyn Agent>,
            || Box::new(DisplayInfoAgent::default()) as Box<dyn Agent>,
        )
    }
}

impl std::fmt::Debug for Lineup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lineup")
            .field("character", &self.character)
            .finish_non_exhaustive()
    }
}

/// A gateway bound to one engine port, with its two agents registered.
pub struct GatewayBinding<G: Gateway> {
    port: u16,
    gateway: G,
    agent_names: [String; 2],
    match_name: String,
    roster: Vec<String>,
}

impl<G: Gateway> GatewayBinding<G> {
    /// Register two new agents from `lineup` on `gateway`.
    ///
    /// The match name embeds the experiment, the instance index and both agent names.
    pub fn new(port: u16, mut gateway: G, lineup: &Lineup, experiment: &str, index: usize) -> Self {
        let first = (lineup.first)();
        let second = (lineup.second)();
        let agent_names = [first.name(), second.name()];
        gateway.register_agent(&agent_names[0], first);
        gateway.register_agent(&agent_names[1], second);

        let match_name = format!(
            "{experiment}-instance-{index}-{}-vs-{}",
            agent_names[0], agent_names[1]
        );
        let roster = vec![
            format!("{match_name}<name>{}", lineup.character),
            lineup.character.clone(),
        ];

        Self {
            port,
            gateway,
            agent_names,
            match_name,
            roster,
        }
    }

    /// Name used to correlate logs of this match.
    pub fn match_name(&self) -> &str {
        &self.match_name
    }

    /// Stage and character list sent with the match request.
    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// Registered agent names, in player order.
    pub fn agent_names(&self) -> &[String; 2] {
        &self.agent_names
    }

    /// Play every game, then close the gateway whatever happened.
    pub async fn play(mut self, games: u32) -> anyhow::Result<()> {
        let result = self
            .gateway
            .run_match(&self.roster, &self.agent_names, games)
            .await;
        if let Err(e) = self.gateway.close().await {
            warn!(port = self.port, "could not close gateway: {e:#}");
        }
        result
    }
}

/// Progress of one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchState {
    /// Games are still being played.
    Running,
    /// Every requested game was played.
    Succeeded,
    /// The gateway reported an error.
    Failed(String),
    /// Stopped before completion by the orchestrator.
    Cancelled,
}

impl MatchState {
    /// Anything but [`MatchState::Running`].
    pub fn is_done(&self) -> bool {
        !matches!(self, MatchState::Running)
    }
}

impl Display for MatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchState::Running => write!(f, "playing"),
            MatchState::Succeeded => write!(f, "finished"),
            MatchState::Failed(reason) => write!(f, "failed ({reason})"),
            MatchState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Handle on a match running concurrently. Its state can be read without blocking.
#[derive(Debug)]
pub struct MatchTask {
    port: u16,
    name: String,
    state: watch::Receiver<MatchState>,
}

impl MatchTask {
    /// Run `binding` for `games` games inside `tasks`.
    pub fn start<G: Gateway>(
        binding: GatewayBinding<G>,
        games: u32,
        tasks: &mut JoinSet<()>,
    ) -> MatchTask {
        let (tx, rx) = watch::channel(MatchState::Running);
        let port = binding.port;
        let name = binding.match_name.clone();

        let span = info_span!("match", port, name = %name);
        tasks.spawn(
            async move {
                info!(games, "match started");
                let state = match binding.play(games).await {
                    Ok(()) => {
                        info!("match finished");
                        MatchState::Succeeded
                    }
                    Err(e) => {
                        error!("match failed: {e:#}");
                        MatchState::Failed(format!("{e:#}"))
                    }
                };
                tx.send_replace(state);
            }
            .instrument(span),
        );

        MatchTask {
            port,
            name,
            state: rx,
        }
    }

    /// Port of the engine this match plays on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Match name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. A task dropped while running reads as [`MatchState::Cancelled`].
    pub fn state(&self) -> MatchState {
        let state = self.state.borrow().clone();
        if state == MatchState::Running && self.state.has_changed().is_err() {
            MatchState::Cancelled
        } else {
            state
        }
    }

    /// Whether the match is over, one way or another.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Wait for the match to be over.
    pub async fn wait(&self) -> MatchState {
        let mut state = self.state.clone();
        let _ = state.wait_for(MatchState::is_done).await;
        self.state()
    }
}
