//! Peer command shell
//!
//! One command per input line; the binary drives the prompt loop and maps
//! each [`Command`] onto a [`crate::peer::PeerNode`] operation.

use thiserror::Error;

/// Command listing printed by `help`
pub const HELP: &str = "commands:
    join <addr> - connect to a tracker
    leave - disconnect from a tracker
    list-songs - list all available songs
    list-peers - list all peers on the network
    play <song> - enqueue a song to be played
    help - show commands
    quit - exit the program";

/// Startup banner
pub const BANNER: &str = r"
              ___.
  _____   ____\_ |__
 /     \ /  _ \| __ \
|  Y Y  (  <_> ) \_\ \
|__|_|  /\____/|___  /
      \/           \/
";

/// Shell prompt
pub const PROMPT: &str = ">>> ";

/// Input the shell could not turn into a command
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShellError {
    #[error("not a valid command")]
    Unknown(String),

    #[error("{0} requires an argument")]
    MissingArgument(&'static str),
}

/// A parsed shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Leave,
    ListSongs,
    ListPeers,
    Play(String),
    Help,
    Quit,
    /// Blank line
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ShellError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(Command::Empty);
        };
        let arg = words.next();

        match name {
            "join" => arg
                .map(|addr| Command::Join(addr.to_string()))
                .ok_or(ShellError::MissingArgument("join")),
            "leave" => Ok(Command::Leave),
            "list-songs" => Ok(Command::ListSongs),
            "list-peers" => Ok(Command::ListPeers),
            "play" => arg
                .map(|song| Command::Play(song.to_string()))
                .ok_or(ShellError::MissingArgument("play")),
            "help" => Ok(Command::Help),
            "quit" => Ok(Command::Quit),
            other => Err(ShellError::Unknown(other.to_string())),
        }
    }
}
