//! Traits at the boundary with the gateway and the agents.
//!
//! The orchestrator never looks inside a game: it hands agents to a [`Gateway`] bound to
//! one engine port, asks for a number of games, and waits.

use async_trait::async_trait;

/// A decision-making participant.
///
/// States and actions travel as text: the agent receives the frame as the engine
/// serialized it, and answers with the command to play.
pub trait Agent: Send {
    /// Name the agent is registered under.
    fn name(&self) -> String;

    /// Pick the action for the given frame.
    fn act(&mut self, state: &str) -> String;
}

/// Connection between a pair of agents and one engine instance.
#[async_trait]
pub trait Gateway: Send + 'static {
    /// Make `agent` available to matches under `name`.
    fn register_agent(&mut self, name: &str, agent: Box<dyn Agent>);

    /// Play `games` games between the two registered agents on the given stage and
    /// character list. Completes once every game has been played.
    ///
    /// # Error
    /// Returned when the engine reports a failure or the connection is lost.
    async fn run_match(
        &mut self,
        roster: &[String],
        agents: &[String; 2],
        games: u32,
    ) -> anyhow::Result<()>;

    /// Release the connection.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// What will be given to the orchestrator to allow it to create gateways
pub trait GatewayFactory<G: Gateway> {
    /// Returns a gateway bound to `port`
    fn new_gateway(&self, port: u16) -> G;
}

#[cfg(test)]
mod interface_tests {
    use super::*;

    struct Echo;

    impl Agent for Echo {
        fn name(&self) -> String {
            "Echo".to_owned()
        }

        fn act(&mut self, state: &str) -> String {
            state.to_owned()
        }
    }

    #[derive(Default)]
    struct CountingGateway {
        port: u16,
        agents: Vec<String>,
        played: u32,
        closed: bool,
    }

    #[async_trait]
    impl Gateway for CountingGateway {
        fn register_agent(&mut self, name: &str, _agent: Box<dyn Agent>) {
            self.agents.push(name.to_owned());
        }

        async fn run_match(
            &mut self,
            _roster: &[String],
            agents: &[String; 2],
            games: u32,
        ) -> anyhow::Result<()> {
            anyhow::ensure!(
                agents.iter().all(|a| self.agents.contains(a)),
                "unregistered agent"
            );
            self.played += games;
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    struct Factory;

    impl GatewayFactory<CountingGateway> for Factory {
        fn new_gateway(&self, port: u16) -> CountingGateway {
            CountingGateway {
                port,
                ..Default::default()
            }
        }
    }

    fn make_gateway<G: Gateway, F: GatewayFactory<G>>(factory: &F, port: u16) -> G {
        factory.new_gateway(port)
    }

    #[test]
    fn test_dyn_agent() {
        let mut agent: Box<dyn Agent> = Box::new(Echo);
        assert_eq!(agent.act("frame 1"), "frame 1");
        assert_eq!(agent.name(), "Echo");
    }

    #[tokio::test]
    async fn test_gateway_through_factory() {
        let mut gateway = make_gateway(&Factory, 8000);
        assert_eq!(gateway.port, 8000);
        gateway.register_agent("Echo", Box::new(Echo));
        gateway.register_agent("Other", Box::new(Echo));

        let names = ["Echo".to_owned(), "Other".to_owned()];
        gateway.run_match(&["ZEN".to_owned()], &names, 3).await.unwrap();
        assert_eq!(gateway.played, 3);

        let unknown = ["Echo".to_owned(), "Nobody".to_owned()];
        assert!(gateway.run_match(&[], &unknown, 1).await.is_err());

        gateway.close().await.unwrap();
        assert!(gateway.closed);
    }
}
