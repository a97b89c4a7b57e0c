//! Handler registration and trigger matching.
//!
//! A handler is an async function taking a [`BotHandle`] and a [`Trigger`].
//! It is registered against either an exact command string or a regular
//! expression anchored at the start of the message, optionally restricted to
//! admins.
//!
//! # Example
//!
//! ```rust,no_run
//! use ircbot::handler::HandlerDescriptor;
//!
//! let ping = HandlerDescriptor::command("ping", "!ping", |bot, trigger| {
//!     Box::pin(async move { bot.send("pong", &trigger.channel).await })
//! });
//! let echo = HandlerDescriptor::regex("echo", r"!echo (.+)$", |bot, trigger| {
//!     Box::pin(async move {
//!         let text = trigger.group(1).unwrap_or_default().to_string();
//!         bot.send(&text, &trigger.channel).await
//!     })
//! })
//! .unwrap();
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;

use crate::connection::BotHandle;
use crate::error::{BotError, Result};

/// One bot-directed channel message, as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub channel: String,
    pub nick: String,
    /// Message text with the `<botname>:` prefix and surrounding whitespace removed.
    pub message: String,
    /// Capture groups of a pattern trigger; index 0 is the whole match.
    pub groups: Vec<Option<String>>,
}

impl Trigger {
    pub fn new(channel: &str, nick: &str, message: &str) -> Self {
        Self {
            channel: channel.to_string(),
            nick: nick.to_string(),
            message: message.to_string(),
            groups: Vec::new(),
        }
    }

    /// Capture group `index`, if the pattern produced one.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

pub type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A handler body.
pub type HandlerFn = Arc<dyn Fn(BotHandle, Trigger) -> BoxFuture + Send + Sync>;

/// When a handler fires.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// The whole message must equal this string.
    Exact(String),
    /// The pattern must match at the start of the message.
    Pattern(Regex),
}

impl Predicate {
    /// Compile a pattern predicate. The pattern is anchored at the start.
    pub fn pattern(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Regex::new(&format!("^(?:{pattern})")).map(Predicate::Pattern)
    }

    /// `None` when the message does not match; otherwise the capture groups
    /// to attach (empty for exact matches).
    pub fn evaluate(&self, message: &str) -> Option<Vec<Option<String>>> {
        match self {
            Predicate::Exact(command) => (command == message).then(Vec::new),
            Predicate::Pattern(regex) => regex.captures(message).map(|caps| {
                caps.iter()
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect()
            }),
        }
    }
}

#[derive(Clone)]
pub struct HandlerDescriptor {
    pub name: String,
    pub predicate: Predicate,
    pub admin_only: bool,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("admin_only", &self.admin_only)
            .finish_non_exhaustive()
    }
}

impl HandlerDescriptor {
    /// Handler fired when the message equals `command` exactly.
    pub fn command<F>(name: &str, command: &str, handler: F) -> Self
    where
        F: Fn(BotHandle, Trigger) -> BoxFuture + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            predicate: Predicate::Exact(command.to_string()),
            admin_only: false,
            handler: Arc::new(handler),
        }
    }

    /// Handler fired when `pattern` matches at the start of the message.
    pub fn regex<F>(name: &str, pattern: &str, handler: F) -> Result<Self>
    where
        F: Fn(BotHandle, Trigger) -> BoxFuture + Send + Sync + 'static,
    {
        let predicate = Predicate::pattern(pattern).map_err(|source| BotError::InvalidPattern {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            predicate,
            admin_only: false,
            handler: Arc::new(handler),
        })
    }

    /// Restrict the handler to configured admins.
    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }
}

/// A handler selected for one trigger, with its own copy of the trigger.
#[derive(Debug)]
pub struct Matched<'a> {
    pub descriptor: &'a HandlerDescriptor,
    pub trigger: Trigger,
}

/// Name-unique, ordered set of handlers. Immutable once the bot is built.
#[derive(Debug, Default)]
pub struct Registry {
    handlers: Vec<HandlerDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<()> {
        if self.contains(&descriptor.name) {
            return Err(BotError::DuplicateName {
                name: descriptor.name,
            });
        }
        self.handlers.push(descriptor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.iter().any(|h| h.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Every handler whose predicate accepts the trigger, in registration
    /// order. Admin-only handlers are skipped for senders outside `admins`.
    pub fn matches(&self, trigger: &Trigger, admins: &HashSet<String>) -> Vec<Matched<'_>> {
        self.handlers
            .iter()
            .filter_map(|descriptor| {
                let groups = descriptor.predicate.evaluate(&trigger.message)?;
                if descriptor.admin_only && !admins.contains(&trigger.nick) {
                    tracing::debug!(
                        handler = %descriptor.name,
                        nick = %trigger.nick,
                        "Skipping admin-only handler for non-admin"
                    );
                    return None;
                }
                let mut trigger = trigger.clone();
                trigger.groups = groups;
                Some(Matched {
                    descriptor,
                    trigger,
                })
            })
            .collect()
    }
}
