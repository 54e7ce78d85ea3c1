//! Line protocol between clients and the switchboard.
//!
//! Both directions carry CRLF-terminated text. Clients send `pickup`,
//! `hangup`, `dial <extension>` and `chat <text>`; the server answers every
//! state transition with a status line and relays chat text as `chat <text>`.

use crate::{Extension, TuState};

/// Line terminator, both directions.
pub const CRLF: &str = "\r\n";

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pickup,
    Hangup,
    Dial(Extension),
    Chat(String),
}

impl Command {
    /// Parses one line, already stripped of its terminator.
    ///
    /// `chat` keeps everything after the first space verbatim, spaces and all,
    /// and the text may be empty. Returns `None` for anything malformed: an
    /// unknown verb, a stray argument on `pickup`/`hangup`, or a `dial`
    /// argument that is not a nonnegative integer. Malformed lines are
    /// ignored by the protocol, so `None` means "no state change".
    pub fn parse(line: &str) -> Option<Command> {
        let (head, rest) = match line.split_once(' ') {
            Some((head, rest)) => (head, Some(rest)),
            None => (line, None),
        };
        match (head, rest) {
            ("pickup", None) => Some(Command::Pickup),
            ("hangup", None) => Some(Command::Hangup),
            ("dial", Some(arg)) => arg.trim().parse::<Extension>().ok().map(Command::Dial),
            ("chat", rest) => Some(Command::Chat(rest.unwrap_or("").to_string())),
            _ => None,
        }
    }
}

/// Formats the status notification for a state, without the trailing CRLF.
///
/// `own` is the unit's extension, reported in `ON HOOK` lines so a client
/// learns its number at registration time; `peer` is the far-end extension
/// reported while connected.
pub fn status_line(state: TuState, own: Extension, peer: Option<Extension>) -> String {
    match state {
        TuState::OnHook => format!("ON HOOK {}", own),
        TuState::Connected => match peer {
            Some(ext) => format!("CONNECTED {}", ext),
            None => "CONNECTED".to_string(),
        },
        other => other.to_string(),
    }
}

/// Formats a relayed chat line, without the trailing CRLF.
pub fn chat_line(text: &str) -> String {
    format!("chat {}", text)
}
