//! Operator commands read line by line from stdin.

use std::path::PathBuf;
use std::str::FromStr;

use cfdp_protocol::{EntityId, PromptKind, TransactionId};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { path: PathBuf, to: Option<EntityId> },
    Cancel(TransactionId),
    Suspend(TransactionId),
    Resume(TransactionId),
    Prompt(TransactionId, PromptKind),
    Status,
    Stats,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("{0}: missing argument")]
    MissingArgument(&'static str),
    #[error("bad transaction id {0:?}, expected <source>:<seq>")]
    BadTransaction(String),
    #[error("bad entity id {0:?}")]
    BadEntity(String),
    #[error("prompt kind must be nak or keepalive, got {0:?}")]
    BadPromptKind(String),
}

fn parse_txn(s: &str) -> Result<TransactionId, CommandError> {
    let bad = || CommandError::BadTransaction(s.to_string());
    let (source, seq) = s.split_once(':').ok_or_else(bad)?;
    let source = source.parse().map_err(|_| bad())?;
    let seq = seq.parse().map_err(|_| bad())?;
    Ok(TransactionId::new(EntityId(source), seq))
}

fn txn_arg<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    verb: &'static str,
) -> Result<TransactionId, CommandError> {
    parse_txn(words.next().ok_or(CommandError::MissingArgument(verb))?)
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Empty)?;
        let cmd = match verb {
            "cancel" => Command::Cancel(txn_arg(&mut words, "cancel")?),
            "suspend" => Command::Suspend(txn_arg(&mut words, "suspend")?),
            "resume" => Command::Resume(txn_arg(&mut words, "resume")?),
            "prompt" => {
                let id = txn_arg(&mut words, "prompt")?;
                let kind = match words.next() {
                    Some("nak") => PromptKind::Nak,
                    Some("keepalive") | Some("keep_alive") => PromptKind::KeepAlive,
                    Some(other) => return Err(CommandError::BadPromptKind(other.to_string())),
                    None => return Err(CommandError::MissingArgument("prompt")),
                };
                Command::Prompt(id, kind)
            }
            "send" => {
                let path = words.next().ok_or(CommandError::MissingArgument("send"))?;
                let to = words
                    .next()
                    .map(|w| w.parse().map(EntityId).map_err(|_| CommandError::BadEntity(w.to_string())))
                    .transpose()?;
                Command::Send { path: PathBuf::from(path), to }
            }
            "status" => Command::Status,
            "stats" => Command::Stats,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(cmd)
    }
}

/// Forwards parsed stdin lines to the dispatcher until stdin closes.
pub fn spawn_stdin_reader(tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(cmd) => {
                        if tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "bad_command", line = %line, error = %e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(event = "stdin_failed", error = %e);
                    break;
                }
            }
        }
        info!(event = "stdin_closed");
    });
}
