//! Interactive shell commands for the `webchannel` binary.
//!
//! One command per line; the first word selects the command and the rest are
//! its arguments. Values and event data may contain spaces.

// Rust guideline compliant 2026-02

use anyhow::{bail, Result};

use crate::ChannelClient;

/// Help text printed by the `help` command.
pub const HELP: &str = "\
commands:
  join <channel> <uri>    join a channel (uri without scheme uses the configured one)
  leave                   leave the current channel
  set <key> <value...>    set a shared value
  get <key>               read a shared value
  send <type> [data...]   broadcast an event
  last                    show the last received event
  status                  show server and channel
  help                    show this help
  quit                    leave and exit";

/// A parsed shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// `join <channel> <uri>`
    Join {
        /// Channel to join.
        channel: String,
        /// Server address.
        uri: String,
    },
    /// `leave`
    Leave,
    /// `set <key> <value...>`
    Set {
        /// Key to set.
        key: String,
        /// Value, possibly empty.
        value: String,
    },
    /// `get <key>`
    Get {
        /// Key to read.
        key: String,
    },
    /// `send <type> [data...]`
    Send {
        /// Event type.
        event_type: String,
        /// Event data, possibly empty.
        data: String,
    },
    /// `last`
    Last,
    /// `status`
    Status,
    /// `help`
    Help,
    /// `quit` / `exit`
    Quit,
}

impl ShellCommand {
    /// Parse one line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();

        let command = match word {
            "join" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next(), args.next()) {
                    (Some(channel), Some(uri), None) => Self::Join {
                        channel: channel.to_string(),
                        uri: uri.to_string(),
                    },
                    _ => bail!("usage: join <channel> <uri>"),
                }
            }
            "leave" => Self::Leave,
            "set" => {
                let Some((key, value)) = split_first_word(rest) else {
                    bail!("usage: set <key> <value...>");
                };
                Self::Set { key, value }
            }
            "get" => {
                if rest.is_empty() {
                    bail!("usage: get <key>");
                }
                Self::Get {
                    key: rest.to_string(),
                }
            }
            "send" => {
                let Some((event_type, data)) = split_first_word(rest) else {
                    bail!("usage: send <type> [data...]");
                };
                Self::Send { event_type, data }
            }
            "last" => Self::Last,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command: {other} (try `help`)"),
        };
        Ok(Some(command))
    }
}

fn split_first_word(s: &str) -> Option<(String, String)> {
    if s.is_empty() {
        return None;
    }
    let (first, rest) = s.split_once(char::is_whitespace).unwrap_or((s, ""));
    Some((first.to_string(), rest.trim_start().to_string()))
}

/// Run `command` against `client` and return the line to print.
pub async fn execute(client: &ChannelClient, command: &ShellCommand) -> String {
    match command {
        ShellCommand::Join { channel, uri } => client
            .join(channel, uri)
            .await
            .unwrap_or_else(|| "join already in progress".to_string()),
        ShellCommand::Leave => client.leave(),
        ShellCommand::Set { key, value } => client.set_value(key, value),
        ShellCommand::Get { key } => client.value_of(key),
        ShellCommand::Send { event_type, data } => client.send_event(event_type, data),
        ShellCommand::Last => format!(
            "type: {} data: {}",
            client.last_event_type(),
            client.last_event_data()
        ),
        ShellCommand::Status => format!(
            "server: {} channel: {}",
            client.report_server_uri(),
            client.report_channel_name()
        ),
        ShellCommand::Help => HELP.to_string(),
        ShellCommand::Quit => client.leave(),
    }
}
