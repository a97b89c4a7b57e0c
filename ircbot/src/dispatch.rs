//! Per-line reactions and handler fan-out.

use std::sync::Arc;

use tokio::io::AsyncWrite;

use crate::codec::{self, Line};
use crate::config::BotConfig;
use crate::connection::{BotHandle, write_line};
use crate::handler::{Registry, Trigger};
use crate::tasks::TaskGroup;

/// What the receive loop should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Reconnect,
}

pub struct Dispatcher {
    config: Arc<BotConfig>,
    registry: Arc<Registry>,
    handle: BotHandle,
    tasks: Arc<TaskGroup>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<BotConfig>,
        registry: Arc<Registry>,
        handle: BotHandle,
        tasks: Arc<TaskGroup>,
    ) -> Self {
        Self {
            config,
            registry,
            handle,
            tasks,
        }
    }

    /// React to one inbound line.
    ///
    /// Order matters: the PONG goes out before anything else, an ERROR stops
    /// processing, a KICK of this bot from a configured channel is answered
    /// with a JOIN, and finally directed channel messages fan out to handlers.
    /// Handlers are spawned and never awaited here.
    pub async fn dispatch<W>(&self, raw: &str, writer: &mut W) -> std::io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!("{raw}");
        let Some(line) = Line::parse(raw) else {
            return Ok(Flow::Continue);
        };

        match line.command.as_str() {
            "PING" => {
                write_line(writer, &codec::pong(&self.config.server)).await?;
            }
            "ERROR" => {
                tracing::error!(
                    server = %self.config.server,
                    reason = line.param(0).unwrap_or_default(),
                    "Error received from server. Reconnecting..."
                );
                return Ok(Flow::Reconnect);
            }
            "KICK" => {
                if let Some(channel) = self.kicked_from(&line) {
                    tracing::warn!(%channel, by = line.nick().unwrap_or_default(), "Kicked, rejoining");
                    write_line(writer, &codec::join(channel)).await?;
                }
            }
            "PRIVMSG" => {
                if let Some(trigger) = self.trigger(raw, &line) {
                    self.launch(trigger);
                }
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn kicked_from<'a>(&self, line: &'a Line) -> Option<&'a str> {
        let channel = line.param(0)?;
        let target = line.param(1)?;
        (target == self.config.nick && self.config.is_channel(channel)).then_some(channel)
    }

    /// A trigger for a PRIVMSG to a configured channel addressed to this bot.
    pub fn trigger(&self, raw: &str, line: &Line) -> Option<Trigger> {
        let channel = line.param(0)?;
        if !self.config.is_channel(channel) {
            return None;
        }
        let text = line.param(1)?;
        let (directed, message) = codec::is_directed_at(text, &self.config.nick);
        if !directed {
            return None;
        }
        let nick = line.nick().unwrap_or_else(|| codec::extract_sender(raw));
        Some(Trigger::new(channel, nick, message))
    }

    /// Spawn every matching handler, in registration order.
    fn launch(&self, trigger: Trigger) {
        for matched in self.registry.matches(&trigger, &self.config.admins) {
            let name = matched.descriptor.name.clone();
            tracing::debug!(
                handler = %name,
                channel = %matched.trigger.channel,
                nick = %matched.trigger.nick,
                "Invoking handler"
            );
            let handler = matched.descriptor.handler.clone();
            let bot = self.handle.clone();
            let trigger = matched.trigger;
            // The closure itself runs inside the supervised task.
            self.tasks.spawn(name, async move { handler(bot, trigger).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BoxFuture, HandlerDescriptor};
    use tokio::sync::mpsc;

    fn dispatcher_with(registry: Registry) -> (Dispatcher, mpsc::Receiver<crate::connection::Command>) {
        let mut config = BotConfig::new("irc.example.org", "bot", &["#rust", "#rust-beginners"]);
        config.admins.insert("alice".to_string());
        let (handle, rx) = BotHandle::new(&config);
        let dispatcher = Dispatcher::new(
            Arc::new(config),
            Arc::new(registry),
            handle,
            Arc::new(TaskGroup::new()),
        );
        (dispatcher, rx)
    }

    fn trigger_for(dispatcher: &Dispatcher, raw: &str) -> Option<Trigger> {
        let line = Line::parse(raw)?;
        dispatcher.trigger(raw, &line)
    }

    fn echo(bot: BotHandle, trigger: Trigger) -> BoxFuture {
        Box::pin(async move { bot.send(&trigger.message, &trigger.channel).await })
    }

    #[tokio::test]
    async fn ping_is_answered_immediately() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        let mut out = Vec::new();
        let flow = dispatcher.dispatch("PING :abc", &mut out).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(out, b"PONG :irc.example.org\r\n");
    }

    #[tokio::test]
    async fn error_requests_reconnect() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        let mut out = Vec::new();
        let flow = dispatcher
            .dispatch("ERROR :Closing Link: bot (Ping timeout)", &mut out)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Reconnect);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn kick_from_configured_channel_rejoins() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        let mut out = Vec::new();
        dispatcher
            .dispatch(":op!o@h KICK #rust bot :behave", &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"JOIN #rust\r\n");

        out.clear();
        dispatcher
            .dispatch(":op!o@h KICK #rust someoneelse :bye", &mut out)
            .await
            .unwrap();
        dispatcher
            .dispatch(":op!o@h KICK #other bot :bye", &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn directed_message_builds_trigger() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        let trigger = trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust :bot:   hello there  ").unwrap();
        assert_eq!(trigger, Trigger::new("#rust", "carol", "hello there"));
    }

    #[test]
    fn similar_channel_names_do_not_collide() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        let trigger = trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust-beginners :bot: hi").unwrap();
        assert_eq!(trigger.channel, "#rust-beginners");
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust-lang :bot: hi").is_none());
    }

    #[test]
    fn undirected_or_foreign_messages_are_ignored() {
        let (dispatcher, _rx) = dispatcher_with(Registry::new());
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust :hello bot").is_none());
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust :bot hello").is_none());
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG bot :bot: hi").is_none());
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #elsewhere :bot: hi").is_none());
        assert!(trigger_for(&dispatcher, ":carol!~c@host PRIVMSG #rust :please say PRIVMSG #rust :bot: x").is_none());
    }

    #[tokio::test]
    async fn matching_handlers_are_launched() {
        let mut registry = Registry::new();
        registry
            .register(HandlerDescriptor::command("echo", "!hi", echo))
            .unwrap();
        let (dispatcher, mut rx) = dispatcher_with(registry);

        let mut out = Vec::new();
        dispatcher
            .dispatch(":carol!~c@host PRIVMSG #rust :bot: !hi", &mut out)
            .await
            .unwrap();
        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.to_line(), "PRIVMSG #rust :!hi");
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn admin_handler_ignores_non_admins() {
        let mut registry = Registry::new();
        registry
            .register(HandlerDescriptor::command("secret", "!secret", echo).admin_only())
            .unwrap();
        registry
            .register(HandlerDescriptor::command("public", "!secret", |bot, trigger| {
                Box::pin(async move { bot.send("public", &trigger.channel).await })
            }))
            .unwrap();
        let (dispatcher, mut rx) = dispatcher_with(registry);

        let mut out = Vec::new();
        dispatcher
            .dispatch(":mallory!~m@host PRIVMSG #rust :bot: !secret", &mut out)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().to_line(), "PRIVMSG #rust :public");

        dispatcher
            .dispatch(":alice!~a@host PRIVMSG #rust :bot: !secret", &mut out)
            .await
            .unwrap();
        let mut lines = vec![
            rx.recv().await.unwrap().to_line(),
            rx.recv().await.unwrap().to_line(),
        ];
        lines.sort();
        assert_eq!(lines, vec!["PRIVMSG #rust :!secret", "PRIVMSG #rust :public"]);
    }
}
