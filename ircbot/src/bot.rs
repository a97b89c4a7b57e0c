//! Bot assembly and top-level run loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ircbot::{Bot, BotConfig, HandlerDescriptor, PeriodicTask};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = BotConfig::new("irc.libera.chat", "mybot", &["#mybot"]);
//! let bot = Bot::builder(config)
//!     .handler(HandlerDescriptor::command("ping", "!ping", |bot, trigger| {
//!         Box::pin(async move { bot.send("pong", &trigger.channel).await })
//!     }))
//!     .periodic(PeriodicTask::new("heartbeat", Duration::from_secs(3600), |bot| {
//!         Box::pin(async move { bot.say("still here", None).await })
//!     }))
//!     .build()?;
//! bot.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::BotConfig;
use crate::connection::{BotHandle, Command, Connection, ConnectionState, Connector};
use crate::control;
use crate::dispatch::Dispatcher;
use crate::error::{BotError, Result};
use crate::handler::{HandlerDescriptor, Registry};
use crate::periodic::{self, PeriodicTask};
use crate::tasks::TaskGroup;
use crate::tls::ServerConnector;

/// Collects handlers and periodic tasks for one bot instance.
#[derive(Debug)]
pub struct BotBuilder {
    config: BotConfig,
    handlers: Vec<HandlerDescriptor>,
    periodic: Vec<PeriodicTask>,
}

impl BotBuilder {
    pub fn handler(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.push(descriptor);
        self
    }

    pub fn handlers(mut self, descriptors: impl IntoIterator<Item = HandlerDescriptor>) -> Self {
        self.handlers.extend(descriptors);
        self
    }

    pub fn periodic(mut self, task: PeriodicTask) -> Self {
        self.periodic.push(task);
        self
    }

    /// Validate and freeze the registries.
    ///
    /// Handler and periodic task names share one namespace; any repeat is an
    /// error. Periodic intervals must be non-zero.
    pub fn build(self) -> Result<Bot> {
        let mut registry = Registry::new();
        for descriptor in self.handlers {
            registry.register(descriptor)?;
        }

        let mut periodic_names = HashSet::new();
        for task in &self.periodic {
            if registry.contains(&task.name) || !periodic_names.insert(task.name.as_str()) {
                return Err(BotError::DuplicateName {
                    name: task.name.clone(),
                });
            }
            if task.interval.is_zero() {
                return Err(BotError::Config(format!(
                    "periodic task {} has a zero interval",
                    task.name
                )));
            }
        }

        if !registry.is_empty() {
            tracing::info!(
                "Handlers: [{}]",
                registry.names().collect::<Vec<_>>().join(", ")
            );
        }
        if !self.periodic.is_empty() {
            tracing::info!(
                "Periodic tasks: [{}]",
                self.periodic
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let (handle, cmd_rx) = BotHandle::new(&self.config);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Ok(Bot {
            config: Arc::new(self.config),
            registry: Arc::new(registry),
            periodic: self.periodic,
            handle,
            cmd_rx,
            state_tx,
            state_rx,
            tasks: Arc::new(TaskGroup::new()),
        })
    }
}

/// A fully assembled bot. Consumed by [`Bot::run`].
pub struct Bot {
    config: Arc<BotConfig>,
    registry: Arc<Registry>,
    periodic: Vec<PeriodicTask>,
    handle: BotHandle,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    tasks: Arc<TaskGroup>,
}

impl Bot {
    pub fn builder(config: BotConfig) -> BotBuilder {
        BotBuilder {
            config,
            handlers: Vec::new(),
            periodic: Vec::new(),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// A send handle usable before and while the bot runs.
    pub fn handle(&self) -> BotHandle {
        self.handle.clone()
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.registry.names().map(str::to_string).collect()
    }

    /// Connect over TCP/TLS and run until Ctrl-C or a fatal error.
    pub async fn run(self) -> Result<()> {
        let connector = ServerConnector::new(&self.config)?;
        self.run_until(connector, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run with a custom transport until `shutdown` resolves or a fatal
    /// error occurs. Background tasks are drained before returning.
    pub async fn run_until<C, S>(self, connector: C, shutdown: S) -> Result<()>
    where
        C: Connector,
        S: Future<Output = ()>,
    {
        let Bot {
            config,
            registry,
            periodic,
            handle,
            cmd_rx,
            state_tx,
            state_rx: _,
            tasks,
        } = self;

        let dispatcher = Dispatcher::new(config.clone(), registry, handle.clone(), tasks.clone());
        let mut connection = Connection::new(
            config.clone(),
            handle.clone(),
            dispatcher,
            cmd_rx,
            state_tx,
        );

        periodic::start(&periodic, &handle, &tasks);

        let control = {
            let config = config.clone();
            let handle = handle.clone();
            let tasks = tasks.clone();
            async move {
                match config.control_addr {
                    Some(addr) => control::listen(addr, config.clone(), handle, tasks).await,
                    None => std::future::pending().await,
                }
            }
        };

        let result = tokio::select! {
            result = connection.run(&connector) => result,
            result = control => {
                if let Err(ref e) = result {
                    tracing::error!(error = %e, "Control listener failed");
                }
                result
            }
            _ = shutdown => {
                tracing::info!("Shutdown requested");
                Ok(())
            }
        };

        connection.terminate();
        tasks.shutdown().await;
        result
    }
}
