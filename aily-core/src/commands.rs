//! `!` command parsing for platform threads.
//!
//! Match is on the first token of the first line, case sensitive. Anything
//! not starting with `!` is plain text for injection; an unrecognised
//! `!word` gets a usage reply rather than being typed into a session.

use crate::ssh::ControlKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadCommand {
    /// `!new <name> [host] [dir]`
    New {
        name: String,
        host: Option<String>,
        dir: Option<String>,
    },
    /// `!kill <name>`
    Kill { name: String },
    /// `!sessions` (alias `!ls`)
    Sessions,
    /// Single-keystroke shortcuts: `!c` `!d` `!z` `!q` `!enter` `!esc`
    Key(ControlKey),
    /// `!word` that matches nothing above.
    Unknown(String),
}

/// Parse a thread message. Returns `None` when the text is not a command
/// at all (does not start with `!`).
pub fn parse_command(text: &str) -> Option<ThreadCommand> {
    let first_line = text.lines().next()?.trim();
    if !first_line.starts_with('!') {
        return None;
    }

    let mut parts = first_line.split_whitespace();
    let head = parts.next()?;

    let command = match head {
        "!new" => {
            let Some(name) = parts.next() else {
                return Some(ThreadCommand::Unknown("!new".to_string()));
            };
            ThreadCommand::New {
                name: name.to_string(),
                host: parts.next().map(ToOwned::to_owned),
                dir: parts.next().map(ToOwned::to_owned),
            }
        }
        "!kill" => {
            let Some(name) = parts.next() else {
                return Some(ThreadCommand::Unknown("!kill".to_string()));
            };
            ThreadCommand::Kill {
                name: name.to_string(),
            }
        }
        "!sessions" | "!ls" => ThreadCommand::Sessions,
        "!c" => ThreadCommand::Key(ControlKey::Interrupt),
        "!d" => ThreadCommand::Key(ControlKey::Eof),
        "!z" => ThreadCommand::Key(ControlKey::Suspend),
        "!q" => ThreadCommand::Key(ControlKey::LiteralQ),
        "!enter" => ThreadCommand::Key(ControlKey::Submit),
        "!esc" => ThreadCommand::Key(ControlKey::Escape),
        other => ThreadCommand::Unknown(other.to_string()),
    };
    Some(command)
}

pub const COMMAND_USAGE: &str =
    "Available: `!new <name> [host] [dir]`, `!kill <name>`, `!sessions`, \
     `!c` `!d` `!z` `!q` `!enter` `!esc`";
