//! ircbot: run a bot from a TOML config file.
//!
//!   ircbot --config bot.toml
//!   ircbot --server irc.libera.chat --nick mybot --channel '#mybot'
//!
//! Built-in commands (addressed as `mybot: <command>`):
//!
//!   !ping          reply with pong
//!   !echo <text>   repeat text
//!   !uptime        host uptime (admins only)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ircbot::exec;
use ircbot::{Bot, ConfigFile, HandlerDescriptor, PeriodicTask};

#[derive(Parser)]
#[command(name = "ircbot", about = "Long-running IRC bot")]
struct Args {
    /// TOML config file
    #[arg(long, short, env = "IRCBOT_CONFIG")]
    config: Option<PathBuf>,

    /// IRC server hostname
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Bot nick
    #[arg(long)]
    nick: Option<String>,

    /// Channel to join (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Control listener address; empty to disable
    #[arg(long)]
    control_addr: Option<String>,

    /// Exit instead of reconnecting on a closed or silent connection
    #[arg(long)]
    strict: bool,

    /// Post a heartbeat to every channel at this interval
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: Option<u64>,
}

impl Args {
    /// CLI flags override the config file.
    fn merge(&self, mut file: ConfigFile) -> ConfigFile {
        if let Some(ref server) = self.server {
            file.server = server.clone();
        }
        if let Some(port) = self.port {
            file.port = port;
        }
        if let Some(ref nick) = self.nick {
            file.nick = nick.clone();
        }
        if !self.channels.is_empty() {
            file.channels = self.channels.clone();
        }
        if let Some(ref addr) = self.control_addr {
            file.control_addr = addr.clone();
        }
        file.strict |= self.strict;
        file
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs when IRCBOT_LOG_JSON=1, human-readable otherwise
    let json_logs = std::env::var("IRCBOT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "ircbot=info".into());
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let file = match args.config {
        Some(ref path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let config = args.merge(file).resolve()?;

    tracing::info!(
        server = %config.server_addr(),
        nick = %config.nick,
        channels = ?config.channels,
        "Starting ircbot"
    );

    let mut builder = Bot::builder(config)
        .handler(HandlerDescriptor::command("ping", "!ping", |bot, trigger| {
            Box::pin(async move {
                bot.send(&format!("{}: pong", trigger.nick), &trigger.channel)
                    .await
            })
        }))
        .handler(HandlerDescriptor::regex("echo", r"!echo (.+)$", |bot, trigger| {
            Box::pin(async move {
                let text = trigger.group(1).unwrap_or_default();
                bot.send(text, &trigger.channel).await
            })
        })?)
        .handler(
            HandlerDescriptor::command("uptime", "!uptime", |bot, trigger| {
                Box::pin(async move {
                    exec::execute_command(&bot, "uptime", Some(&trigger.channel)).await
                })
            })
            .admin_only(),
        );

    if let Some(secs) = args.heartbeat_secs {
        builder = builder.periodic(PeriodicTask::new(
            "heartbeat",
            Duration::from_secs(secs),
            |bot| Box::pin(async move { bot.say("still here", None).await }),
        ));
    }

    let bot = builder.build()?;
    bot.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_heartbeat_is_rejected() {
        assert!(Args::try_parse_from(["ircbot", "--heartbeat-secs", "0"]).is_err());
        let args = Args::try_parse_from(["ircbot", "--heartbeat-secs", "30"]).unwrap();
        assert_eq!(args.heartbeat_secs, Some(30));
    }

    #[test]
    fn flags_override_file_values() {
        let args = Args::try_parse_from([
            "ircbot",
            "--nick",
            "other",
            "--channel",
            "#x",
            "--channel",
            "#y",
            "--strict",
        ])
        .unwrap();
        let file = ConfigFile::parse("server = \"irc.example.org\"\nnick = \"bot\"\nchannels = [\"#a\"]\n")
            .unwrap();
        let config = args.merge(file).resolve().unwrap();
        assert_eq!(config.nick, "other");
        assert_eq!(config.channels, vec!["#x", "#y"]);
        assert!(config.strict);
    }
}
