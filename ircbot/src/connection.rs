//! Connection manager: owns the single session with the server.
//!
//! The receive loop is the only writer on the wire. Everything else
//! (handlers, periodic tasks, the control listener) sends through a
//! [`BotHandle`], which queues [`Command`]s that the loop writes one line at
//! a time between reads. Keepalive and rejoin replies are written by the
//! loop itself, immediately, while it processes the line that caused them.
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Joining -> Active
//!                     ^                                     |
//!                     +------------- Reconnecting <---------+
//!                                                           |
//!                                        Terminated <-------+
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{self, LineDecoder, MAX_RECV_BYTES};
use crate::config::BotConfig;
use crate::dispatch::{Dispatcher, Flow};
use crate::error::BotError;

/// Queue depth between senders and the receive loop.
const COMMAND_QUEUE: usize = 256;
/// First reconnect delay after a session that never received anything.
const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Any bidirectional byte stream the bot can speak the protocol over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type Transport = Box<dyn AsyncStream>;

pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Transport, BotError>> + Send + 'a>>;

/// Opens transports to the server. Called once per (re)connect.
pub trait Connector: Send + Sync {
    fn connect(&self) -> ConnectFuture<'_>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Joining,
    Active,
    Reconnecting,
    Terminated,
}

/// Outbound requests queued by a [`BotHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Privmsg { target: String, text: String },
    Join(String),
    Raw(String),
}

impl Command {
    pub fn to_line(&self) -> String {
        match self {
            Command::Privmsg { target, text } => codec::privmsg(target, text),
            Command::Join(channel) => codec::join(channel),
            Command::Raw(line) => codec::sanitize(line),
        }
    }
}

/// Cloneable send capability handed to handlers and background tasks.
#[derive(Debug, Clone)]
pub struct BotHandle {
    cmd_tx: mpsc::Sender<Command>,
    nick: Arc<str>,
    channels: Arc<[String]>,
}

impl BotHandle {
    pub(crate) fn new(config: &BotConfig) -> (Self, mpsc::Receiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = Self {
            cmd_tx,
            nick: Arc::from(config.nick.as_str()),
            channels: config.channels.clone().into(),
        };
        (handle, cmd_rx)
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Configured channels.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Send `text` to `channel` as one line. Empty text is a no-op.
    pub async fn send(&self, text: &str, channel: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Privmsg {
                target: channel.to_string(),
                text: codec::sanitize(text),
            })
            .await?;
        Ok(())
    }

    /// Send to one channel, or to every configured channel when `None`.
    pub async fn say(&self, text: &str, channel: Option<&str>) -> Result<()> {
        match channel {
            Some(channel) => self.send(text, channel).await,
            None => {
                for channel in self.channels.iter() {
                    self.send(text, channel).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn join(&self, channel: &str) -> Result<()> {
        self.cmd_tx.send(Command::Join(channel.to_string())).await?;
        Ok(())
    }

    pub async fn raw(&self, line: &str) -> Result<()> {
        self.cmd_tx.send(Command::Raw(line.to_string())).await?;
        Ok(())
    }
}

/// Why a session ended.
enum SessionEnd {
    Reconnect(String),
    Fatal(BotError),
}

/// Read side of the live session.
struct Inbound {
    reader: ReadHalf<Transport>,
    decoder: LineDecoder,
    buf: Vec<u8>,
}

impl Inbound {
    /// `Ok(None)` on end of stream. Cancel safe.
    async fn read_lines(&mut self) -> std::io::Result<Option<Vec<String>>> {
        let n = self.reader.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.decoder.feed(&self.buf[..n])))
    }
}

/// Write one line plus terminator and flush it.
pub(crate) async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await
}

pub(crate) struct Connection {
    config: Arc<BotConfig>,
    handle: BotHandle,
    dispatcher: Dispatcher,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        config: Arc<BotConfig>,
        handle: BotHandle,
        dispatcher: Dispatcher,
        cmd_rx: mpsc::Receiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            config,
            handle,
            dispatcher,
            cmd_rx,
            state_tx,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "Connection state changed");
        }
    }

    pub(crate) fn terminate(&self) {
        self.set_state(ConnectionState::Terminated);
    }

    /// Connect and keep the session alive until a fatal condition.
    pub(crate) async fn run(&mut self, connector: &dyn Connector) -> Result<(), BotError> {
        let mut backoff = BACKOFF_MIN;
        loop {
            self.set_state(ConnectionState::Connecting);
            tracing::info!(server = %self.config.server_addr(), "Connecting");
            let transport = match connector.connect().await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::error!(error = %e, "Connection failed");
                    self.set_state(ConnectionState::Terminated);
                    return Err(e);
                }
            };

            let (reader, mut writer) = tokio::io::split(transport);
            let mut inbound = Inbound {
                reader,
                decoder: LineDecoder::new(),
                buf: vec![0; MAX_RECV_BYTES],
            };

            self.set_state(ConnectionState::Handshaking);
            let (end, received) = match self.handshake(&mut writer).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Joining);
                    let joiner = self.schedule_join();
                    self.set_state(ConnectionState::Active);
                    let result = self.serve(&mut inbound, &mut writer).await;
                    joiner.abort();
                    result
                }
                Err(e) => (SessionEnd::Reconnect(format!("handshake failed: {e}")), false),
            };

            if let Err(e) = close(&mut writer).await {
                tracing::debug!(error = %e, "Error while closing transport");
            }

            match end {
                SessionEnd::Reconnect(reason) => {
                    self.set_state(ConnectionState::Reconnecting);
                    if received {
                        backoff = BACKOFF_MIN;
                        tracing::error!(%reason, server = %self.config.server, "Reconnecting");
                    } else {
                        tracing::error!(%reason, delay = ?backoff, "Reconnecting after delay");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
                SessionEnd::Fatal(e) => {
                    tracing::error!(error = %e, "Shutting down bot");
                    self.set_state(ConnectionState::Terminated);
                    return Err(e);
                }
            }
        }
    }

    async fn handshake<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        let nick = &self.config.nick;
        write_line(writer, &codec::user(nick)).await?;
        write_line(writer, &codec::nick(nick)).await?;
        if let Some(ref password) = self.config.password {
            write_line(writer, &codec::identify(password)).await?;
            tracing::debug!(%nick, "Sent IDENTIFY");
        }
        tracing::info!(%nick, "Registered, joining channels after {:?}", self.config.join_delay);
        Ok(())
    }

    /// JOIN every configured channel after the settle delay, off the receive loop.
    fn schedule_join(&self) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let delay = self.config.join_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for channel in handle.channels().to_vec() {
                if let Err(e) = handle.join(&channel).await {
                    tracing::warn!(%channel, error = %e, "Failed to queue JOIN");
                    return;
                }
                tracing::info!(%channel, "Joining");
            }
        })
    }

    /// Pump lines and queued commands until the session must end.
    ///
    /// The flag reports whether anything was received on this session.
    async fn serve<W: AsyncWrite + Unpin>(
        &mut self,
        inbound: &mut Inbound,
        writer: &mut W,
    ) -> (SessionEnd, bool) {
        let timeout = self.config.receive_timeout;
        let mut deadline = Instant::now() + timeout;
        let mut received = false;

        loop {
            tokio::select! {
                read = inbound.read_lines() => {
                    let lines = match read {
                        Ok(Some(lines)) => lines,
                        Ok(None) if self.config.strict => {
                            return (SessionEnd::Fatal(BotError::ConnectionClosed), received);
                        }
                        Ok(None) => {
                            return (SessionEnd::Reconnect("connection closed by server".into()), received);
                        }
                        Err(e) => return (SessionEnd::Reconnect(format!("read failed: {e}")), received),
                    };
                    received = true;
                    deadline = Instant::now() + timeout;

                    for line in &lines {
                        match self.dispatcher.dispatch(line, writer).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Reconnect) => {
                                return (SessionEnd::Reconnect(format!("error from {}", self.config.server)), received);
                            }
                            Err(e) => return (SessionEnd::Reconnect(format!("write failed: {e}")), received),
                        }
                    }
                }
                // The connection holds a handle itself, so the queue never closes.
                Some(cmd) = self.cmd_rx.recv() => {
                    if let Err(e) = write_line(writer, &cmd.to_line()).await {
                        return (SessionEnd::Reconnect(format!("write failed: {e}")), received);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::error!("No data received for {} seconds", timeout.as_secs());
                    if self.config.strict {
                        return (SessionEnd::Fatal(BotError::Idle(timeout)), received);
                    }
                    return (SessionEnd::Reconnect("idle timeout".into()), received);
                }
            }
        }
    }
}

/// Flush, then shut the write side down.
async fn close<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.flush().await?;
    writer.shutdown().await
}
