//! IRC wire message parsing.
//!
//! One [`Event`] per raw line:
//! `[@tags ]:[source ]COMMAND[ arg1 .. argN][ :trailing]\r\n`
//!
//! Supports IRCv3 message tags: `@key=value;key2=value2 :prefix COMMAND params`

use std::collections::HashMap;

use crate::error::ParseError;

/// A parsed wire line. Immutable once dispatch begins, except for the
/// CTCP reclassification applied before any handler sees it.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// Uppercased command or numeric, e.g. `PRIVMSG`, `001`.
    pub code: String,
    /// The raw line with trailing line terminators stripped.
    pub raw: String,
    /// IRCv3 message tags, values unescaped. Empty when absent.
    pub tags: HashMap<String, String>,
    /// The full source token (`nick!user@host` or a server name).
    pub source: String,
    /// Sender nick, when the source carries a full hostmask.
    pub nick: String,
    /// Sender username, when the source carries a full hostmask.
    pub user: String,
    /// Sender host, when the source carries a full hostmask.
    pub host: String,
    /// Ordered arguments; the last may be the trailing free-text.
    pub arguments: Vec<String>,
}

impl Event {
    /// Parse a raw IRC line, including optional message tags.
    ///
    /// The only rejection is the empty line: a single-token command
    /// (`PING`) is a valid message, and no larger minimum length is
    /// enforced.
    pub fn parse(line: &str) -> Result<Event, ParseError> {
        let mut msg = line.trim_end_matches(['\r', '\n']);
        if msg.is_empty() {
            return Err(ParseError);
        }

        let mut event = Event {
            raw: msg.to_string(),
            ..Event::default()
        };

        if let Some(rest) = msg.strip_prefix('@') {
            let i = rest.find(' ').ok_or(ParseError)?;
            for pair in rest[..i].split(';') {
                if pair.is_empty() {
                    continue;
                }
                match pair.split_once('=') {
                    Some((key, value)) => {
                        event.tags.insert(key.to_string(), unescape_tag_value(value));
                    }
                    None => {
                        event.tags.insert(pair.to_string(), String::new());
                    }
                }
            }
            msg = &rest[i + 1..];
        }

        if let Some(rest) = msg.strip_prefix(':') {
            let i = rest.find(' ').ok_or(ParseError)?;
            event.source = rest[..i].to_string();
            msg = &rest[i + 1..];

            // nick!user@host only decomposes when '!' precedes '@'
            if let (Some(bang), Some(at)) = (event.source.find('!'), event.source.find('@'))
                && bang < at
            {
                event.nick = event.source[..bang].to_string();
                event.user = event.source[bang + 1..at].to_string();
                event.host = event.source[at + 1..].to_string();
            }
        }

        let (head, trailing) = match msg.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (msg, None),
        };
        let mut args = head.split(' ');
        event.code = args.next().unwrap_or_default().to_ascii_uppercase();
        event.arguments = args.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            event.arguments.push(trailing.to_string());
        }

        Ok(event)
    }

    /// The last argument, conventionally the free-text payload.
    /// Empty string when there are no arguments.
    pub fn message(&self) -> &str {
        self.arguments.last().map(String::as_str).unwrap_or("")
    }
}

/// Unescape IRCv3 tag values.
/// `\:` → `;`, `\s` → space, `\\` → `\`, `\r` → CR, `\n` → LF
pub(crate) fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Escape a value for IRCv3 tag encoding.
/// `;` → `\:`, space → `\s`, `\` → `\\`, CR → `\r`, LF → `\n`
pub(crate) fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}
