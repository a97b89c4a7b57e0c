//! Local control socket.
//!
//! An operator connects (e.g. with `nc 127.0.0.1 9999`) and types
//! `<channel> <message>` lines; each is forwarded to the channel through the
//! bot's normal send path. An empty line closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::config::BotConfig;
use crate::connection::BotHandle;
use crate::error::Result;
use crate::tasks::TaskGroup;

pub const GREETING: &str = "Please enter your message starting with the channel name.\n";
pub const PROMPT: &str = ">>> ";
/// Longest request accepted from a peer, terminator included.
pub const MAX_REQUEST_BYTES: u64 = 512;

/// Bind `addr` and serve control connections until the task is dropped.
pub async fn listen(
    addr: SocketAddr,
    config: Arc<BotConfig>,
    handle: BotHandle,
    group: Arc<TaskGroup>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Starting control listener on {}", listener.local_addr()?);
    serve(listener, config, handle, group).await
}

/// Accept loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    config: Arc<BotConfig>,
    handle: BotHandle,
    group: Arc<TaskGroup>,
) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Control accept failed");
                continue;
            }
        };
        tracing::info!(%peer, "New control connection");
        let config = config.clone();
        let handle = handle.clone();
        group.spawn(format!("control:{peer}"), async move {
            let result = serve_connection(stream, &config, &handle).await;
            tracing::info!(%peer, "Control connection closed");
            result.map_err(anyhow::Error::from)
        });
    }
}

/// Serve one control peer until it sends an empty line or disconnects.
pub async fn serve_connection<S>(stream: S, config: &BotConfig, handle: &BotHandle) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(GREETING.as_bytes()).await?;
    loop {
        writer.write_all(PROMPT.as_bytes()).await?;
        writer.flush().await?;

        line.clear();
        let n = (&mut reader)
            .take(MAX_REQUEST_BYTES)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            break;
        }
        if n as u64 == MAX_REQUEST_BYTES && !line.ends_with('\n') {
            tracing::warn!(bytes = n, "Control request too long, closing");
            writer.write_all(b"'Request too long'\n").await?;
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            break;
        }

        let reply = forward(text, config, handle).await;
        writer.write_all(reply.as_bytes()).await?;
    }

    writer.shutdown().await?;
    Ok(())
}

/// Route one `<channel> <message>` request and build the reply for the peer.
async fn forward(text: &str, config: &BotConfig, handle: &BotHandle) -> String {
    let (channel, message) = text.split_once(' ').unwrap_or((text, ""));
    let message = message.trim();
    if !config.is_channel(channel) {
        return format!("'Unknown channel: {channel}'\n");
    }
    match handle.send(message, channel).await {
        Ok(()) => format!("'{message}'\n"),
        Err(e) => {
            tracing::error!(%channel, error = %e, "Control message could not be queued");
            format!("'Failed to send: {e}'\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BotConfig {
        BotConfig::new("irc.example.org", "bot", &["#general", "#ops"])
    }

    async fn session(input: &str) -> (String, Vec<String>) {
        let config = config();
        let (handle, mut rx) = BotHandle::new(&config);
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();
        serve_connection(server, &config, &handle).await.unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        drop(handle);
        let mut sent = Vec::new();
        while let Some(cmd) = rx.recv().await {
            sent.push(cmd.to_line());
        }
        (output, sent)
    }

    #[tokio::test]
    async fn known_channel_is_forwarded_and_acknowledged() {
        let (output, sent) = session("#general hello\n\n").await;
        assert_eq!(sent, vec!["PRIVMSG #general :hello"]);
        assert_eq!(output, format!("{GREETING}{PROMPT}'hello'\n{PROMPT}"));
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let (output, sent) = session("#nope hi\n\n").await;
        assert!(sent.is_empty());
        assert!(output.contains("'Unknown channel: #nope'"));
    }

    #[tokio::test]
    async fn several_requests_then_eof() {
        let (output, sent) = session("#ops deploy done\n#general  spaced out \n").await;
        assert_eq!(sent, vec!["PRIVMSG #ops :deploy done", "PRIVMSG #general :spaced out"]);
        assert!(output.contains("'deploy done'"));
        assert!(output.ends_with(PROMPT));
    }

    #[tokio::test]
    async fn channel_without_text_sends_nothing() {
        let (output, sent) = session("#general\n\n").await;
        assert!(sent.is_empty());
        assert!(output.contains("''"));
    }

    #[tokio::test]
    async fn overlong_request_closes_connection() {
        let input = format!("#general {}", "x".repeat(1024));
        let (output, sent) = session(&input).await;
        assert!(sent.is_empty());
        assert!(output.ends_with("'Request too long'\n"));
    }

    #[tokio::test]
    async fn listener_serves_tcp_peers() {
        let config = Arc::new(config());
        let (handle, mut rx) = BotHandle::new(&config);
        let group = Arc::new(TaskGroup::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, config, handle, group.clone()));

        let mut peer = tokio::net::TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"#ops from tcp\n\n").await.unwrap();
        let mut output = String::new();
        peer.read_to_string(&mut output).await.unwrap();

        assert!(output.contains("'from tcp'"));
        assert_eq!(rx.recv().await.unwrap().to_line(), "PRIVMSG #ops :from tcp");
        server.abort();
        group.shutdown().await;
    }
}
