//! Newline-delimited TCP gateway.
//!
//! Every message is one line of tab-separated fields:
//!
//! - runner -> engine: `RUN\t<games>\t<agent a>\t<agent b>\t<roster...>`
//! - engine -> runner: `STATE\t<slot>\t<payload>`, answered with `ACTION\t<slot>\t<action>`
//! - engine -> runner: `GAME_END`, `MATCH_END`, `ERROR\t<message>`
//!
//! `slot` is the player index, `0` or `1`, in the order of the `RUN` request.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, trace};

use crate::game_interface::{Agent, Gateway, GatewayFactory};

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(
        host: IpAddr,
        port: u16,
        attempts: u32,
        retry_delay: Duration,
    ) -> anyhow::Result<Connection> {
        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect((host, port)).await {
                Ok(stream) => break stream,
                Err(e) if attempt < attempts => {
                    debug!(attempt, "engine not reachable yet: {e}");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("no connection made to engine after {attempt} attempts")
                    })
                }
            }
        };
        let (read, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }

    async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        trace!(line, "sending");
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("I/O error while sending msg")
    }

    async fn recv(&mut self) -> anyhow::Result<Option<String>> {
        self.lines
            .next_line()
            .await
            .context("error while reading stream")
    }
}

/// One parsed line from the engine.
#[derive(Debug, PartialEq, Eq)]
enum EngineMessage<'a> {
    State { slot: usize, payload: &'a str },
    GameEnd,
    MatchEnd,
    Error(&'a str),
    Unknown,
}

impl<'a> EngineMessage<'a> {
    fn parse(line: &'a str) -> anyhow::Result<EngineMessage<'a>> {
        let mut fields = line.splitn(3, '\t');
        let message = match fields.next().unwrap_or_default() {
            "STATE" => {
                let slot = fields
                    .next()
                    .context("STATE without slot")?
                    .parse::<usize>()
                    .context("invalid slot")?;
                if slot > 1 {
                    bail!("invalid slot {slot}");
                }
                EngineMessage::State {
                    slot,
                    payload: fields.next().unwrap_or_default(),
                }
            }
            "GAME_END" => EngineMessage::GameEnd,
            "MATCH_END" => EngineMessage::MatchEnd,
            "ERROR" => EngineMessage::Error(line.split_once('\t').map_or("", |(_, msg)| msg)),
            _ => EngineMessage::Unknown,
        };
        Ok(message)
    }
}

/// [`Gateway`] speaking the line protocol described in the [module documentation](self).
pub struct LineGateway {
    host: IpAddr,
    port: u16,
    connect_attempts: u32,
    retry_delay: Duration,
    agents: HashMap<String, Box<dyn Agent>>,
    connection: Option<Connection>,
}

impl LineGateway {
    /// Gateway to `host:port`. Nothing is connected before [`Gateway::run_match`].
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self {
            host,
            port,
            connect_attempts: LineGatewayFactory::DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: LineGatewayFactory::DEFAULT_RETRY_DELAY,
            agents: HashMap::new(),
            connection: None,
        }
    }

    /// Bound the connection attempts: `attempts` tries, `retry_delay` apart.
    pub fn with_retries(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait]
impl Gateway for LineGateway {
    fn register_agent(&mut self, name: &str, agent: Box<dyn Agent>) {
        self.agents.insert(name.to_owned(), agent);
    }

    #[instrument(skip_all, fields(port = self.port))]
    async fn run_match(
        &mut self,
        roster: &[String],
        agents: &[String; 2],
        games: u32,
    ) -> anyhow::Result<()> {
        for name in agents {
            if !self.agents.contains_key(name) {
                bail!("agent {name} is not registered");
            }
        }

        if self.connection.is_none() {
            let connection = Connection::open(
                self.host,
                self.port,
                self.connect_attempts,
                self.retry_delay,
            )
            .await?;
            self.connection = Some(connection);
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("not connected"))?;
        let players = &mut self.agents;

        let mut request = vec!["RUN".to_owned(), games.to_string()];
        request.extend(agents.iter().cloned());
        request.extend(roster.iter().cloned());
        connection.send(&request.join("\t")).await?;

        let mut played = 0;
        while let Some(line) = connection.recv().await? {
            match EngineMessage::parse(&line)? {
                EngineMessage::State { slot, payload } => {
                    let agent = players
                        .get_mut(&agents[slot])
                        .ok_or_else(|| anyhow!("agent {} vanished", agents[slot]))?;
                    let action = agent.act(payload);
                    connection.send(&format!("ACTION\t{slot}\t{action}")).await?;
                }
                EngineMessage::GameEnd => {
                    played += 1;
                    info!(played, games, "game over");
                }
                EngineMessage::MatchEnd => {
                    if played < games {
                        bail!("match ended after {played}/{games} games");
                    }
                    return Ok(());
                }
                EngineMessage::Error(msg) => bail!("engine error: {msg}"),
                EngineMessage::Unknown => trace!(line, "ignored"),
            }
        }
        bail!("connection closed by engine after {played}/{games} games")
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut connection) = self.connection.take() {
            connection
                .writer
                .shutdown()
                .await
                .context("could not shut the connection down")?;
        }
        Ok(())
    }
}

/// Builds [`LineGateway`]s to engines on a single host.
#[derive(Debug, Clone)]
pub struct LineGatewayFactory {
    host: IpAddr,
    connect_attempts: u32,
    retry_delay: Duration,
}

impl LineGatewayFactory {
    /// Connection attempts before a match is declared failed.
    pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
    /// Pause between two connection attempts.
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

    /// Engines on `host`.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            connect_attempts: Self::DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// See [`LineGateway::with_retries`].
    pub fn with_retries(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for LineGatewayFactory {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl GatewayFactory<LineGateway> for LineGatewayFactory {
    fn new_gateway(&self, port: u16) -> LineGateway {
        LineGateway::new(self.host, port).with_retries(self.connect_attempts, self.retry_delay)
    }
}
