//! ircbot: a long-running IRC bot runtime.
//!
//! Keeps one TLS connection to a server alive across errors and silence,
//! dispatches messages addressed to the bot (`<nick>: ...`) to registered
//! handlers, runs periodic tasks, and accepts operator messages on a local
//! control socket. All outbound traffic goes through one [`BotHandle`].

pub mod bot;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod handler;
pub mod periodic;
pub mod tasks;
pub mod tls;

pub use bot::{Bot, BotBuilder};
pub use config::{BotConfig, ConfigFile};
pub use connection::{BotHandle, ConnectionState, Connector};
pub use error::BotError;
pub use handler::{HandlerDescriptor, Trigger};
pub use periodic::PeriodicTask;
