//! Line codec: bytes to protocol lines, lines to fields, and the outbound
//! command formatters.
//!
//! Parsing is deliberately shallow. The bot only needs the prefix, the
//! command keyword and the parameters to react to PING, ERROR, KICK and
//! PRIVMSG; numerics and capabilities pass through untouched.

/// Upper bound on bytes requested from the transport per read.
pub const MAX_RECV_BYTES: usize = 8192;

/// A partial line longer than this is flushed as-is instead of buffering
/// forever on a peer that never sends a terminator.
const MAX_PENDING_BYTES: usize = 4 * MAX_RECV_BYTES;

/// Split one chunk of raw bytes into text lines.
///
/// Lines are separated by CRLF (a bare LF is accepted too). A trailing empty
/// fragment is discarded and invalid UTF-8 is replaced rather than rejected.
pub fn decode_frame(raw: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Reassembles lines that arrive split across several reads.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(end) = self.pending.iter().rposition(|b| *b == b'\n') else {
            if self.pending.len() > MAX_PENDING_BYTES {
                let overflow = std::mem::take(&mut self.pending);
                return decode_frame(&overflow);
            }
            return Vec::new();
        };
        let rest = self.pending.split_off(end + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        decode_frame(&complete)
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Sender identity of a line: the text before the first `!`, after one
/// leading `:` is removed.
pub fn extract_sender(line: &str) -> &str {
    let line = line.strip_prefix(':').unwrap_or(line);
    match line.split_once('!') {
        Some((nick, _)) => nick,
        None => line,
    }
}

/// Message text of a PRIVMSG line, or `""` when the line carries none.
pub fn extract_channel_message(line: &str) -> String {
    Line::parse(line)
        .filter(|l| l.command == "PRIVMSG")
        .and_then(|l| l.params.get(1).cloned())
        .unwrap_or_default()
}

/// Whether `message` addresses `own_name` as `<own_name>:`.
///
/// Returns the message with that prefix and surrounding whitespace removed.
/// When not addressed, the message is returned unchanged.
pub fn is_directed_at<'a>(message: &'a str, own_name: &str) -> (bool, &'a str) {
    match message
        .strip_prefix(own_name)
        .and_then(|rest| rest.strip_prefix(':'))
    {
        Some(rest) if !own_name.is_empty() => (true, rest.trim()),
        _ => (false, message),
    }
}

/// A tokenized protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub prefix: Option<String>,
    /// Upper-cased command keyword.
    pub command: String,
    /// Middle parameters followed by the trailing one, if any.
    pub params: Vec<String>,
}

impl Line {
    /// Tokenize a raw line. Message tags are skipped.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);

        if rest.starts_with('@') {
            let (_, after) = rest.split_once(' ')?;
            rest = after;
        }
        rest = rest.trim_start_matches(' ');

        let prefix = match rest.strip_prefix(':') {
            Some(stripped) => {
                let (pfx, after) = stripped.split_once(' ')?;
                rest = after.trim_start_matches(' ');
                Some(pfx.to_string())
            }
            None => None,
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((cmd, after)) => (cmd, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Line {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick part of the prefix (`nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split_once('!').map_or(p, |(nick, _)| nick))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

// Outbound formatting. Each returns one line without the terminator.

pub fn user(name: &str) -> String {
    format!("USER {name} 8 * :{name}")
}

pub fn nick(name: &str) -> String {
    format!("NICK {name}")
}

pub fn identify(secret: &str) -> String {
    format!("PRIVMSG NickServ :IDENTIFY {secret}")
}

pub fn join(channel: &str) -> String {
    format!("JOIN {channel}")
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {target} :{text}")
}

pub fn pong(host: &str) -> String {
    format!("PONG :{host}")
}

/// Replace line terminators so a payload can never smuggle a second command.
pub fn sanitize(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_splits_on_crlf_and_drops_trailing_fragment() {
        let lines = decode_frame(b"PING :a\r\n:n!u@h PRIVMSG #c :hi\r\n");
        assert_eq!(lines, vec!["PING :a", ":n!u@h PRIVMSG #c :hi"]);
    }

    #[test]
    fn decode_tolerates_invalid_utf8() {
        let lines = decode_frame(b"PRIVMSG #c :caf\xff\r\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("PRIVMSG #c :caf"));
    }

    #[test]
    fn decoder_reassembles_split_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"PING :irc.exa").is_empty());
        assert_eq!(decoder.pending(), 13);
        assert_eq!(decoder.feed(b"mple.org\r\nNICK"), vec!["PING :irc.example.org"]);
        assert_eq!(decoder.feed(b" x\r\n"), vec!["NICK x"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decoder_flushes_oversized_partial_line() {
        let mut decoder = LineDecoder::new();
        let junk = vec![b'a'; MAX_PENDING_BYTES + 1];
        let lines = decoder.feed(&junk);
        assert_eq!(lines.len(), 1);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn sender_is_text_before_bang() {
        assert_eq!(extract_sender(":alice!~a@host PRIVMSG #c :hi"), "alice");
        assert_eq!(extract_sender("alice!~a@host"), "alice");
    }

    #[test]
    fn channel_message_payload() {
        assert_eq!(
            extract_channel_message(":alice!~a@host PRIVMSG #c :bot: hi there"),
            "bot: hi there"
        );
        assert_eq!(extract_channel_message(":server 001 bot :Welcome"), "");
        assert_eq!(extract_channel_message("PING :x"), "");
    }

    #[test]
    fn directed_requires_name_and_colon() {
        assert_eq!(is_directed_at("bot: !ping ", "bot"), (true, "!ping"));
        assert_eq!(is_directed_at("bot:!ping", "bot"), (true, "!ping"));
        assert_eq!(is_directed_at("bot !ping", "bot"), (false, "bot !ping"));
        assert_eq!(is_directed_at("botty: hi", "bot"), (false, "botty: hi"));
        assert_eq!(is_directed_at("hey bot: hi", "bot"), (false, "hey bot: hi"));
    }

    #[test]
    fn parse_full_line() {
        let line = Line::parse(":alice!~a@host PRIVMSG #rust :bot: hello world").unwrap();
        assert_eq!(line.prefix.as_deref(), Some("alice!~a@host"));
        assert_eq!(line.nick(), Some("alice"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#rust", "bot: hello world"]);
    }

    #[test]
    fn parse_skips_tags_and_uppercases_command() {
        let line = Line::parse("@time=now :op!o@h kick #rust bot :bye").unwrap();
        assert_eq!(line.command, "KICK");
        assert_eq!(line.param(0), Some("#rust"));
        assert_eq!(line.param(1), Some("bot"));
        assert_eq!(line.param(2), Some("bye"));
    }

    #[test]
    fn parse_bare_command() {
        let line = Line::parse("PING :irc.example.org").unwrap();
        assert!(line.prefix.is_none());
        assert_eq!(line.command, "PING");
        assert_eq!(line.param(0), Some("irc.example.org"));
        assert!(Line::parse("").is_none());
    }

    #[test]
    fn outbound_formats() {
        assert_eq!(user("bot"), "USER bot 8 * :bot");
        assert_eq!(nick("bot"), "NICK bot");
        assert_eq!(identify("pw"), "PRIVMSG NickServ :IDENTIFY pw");
        assert_eq!(join("#c"), "JOIN #c");
        assert_eq!(privmsg("#c", "hi"), "PRIVMSG #c :hi");
        assert_eq!(pong("irc.example.org"), "PONG :irc.example.org");
        assert_eq!(sanitize("a\r\nQUIT"), "a  QUIT");
    }
}
