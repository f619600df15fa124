//! Operator commands.
//!
//! Commands arrive from the HTTP API or the Telegram listener and are queued
//! for the scheduler, which is the only owner of positions and pause state.
//! Each request carries a oneshot channel for the reply.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::data::clean_symbol;
use crate::error::{TradingError, TradingResult};

/// How long a submitter waits for the scheduler to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of trades listed by `Trades`.
const DEFAULT_TRADE_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    Status,
    Positions,
    Balance,
    Trades {
        #[serde(default = "default_trade_limit")]
        limit: usize,
    },
    /// Recent decision log entries
    Signals,
    Buy { symbol: String, value: f64 },
    /// Sell whatever the broker holds, tracked or not
    Sell { symbol: String },
    /// Close a tracked position
    Close { symbol: String },
    CloseAll,
    Pause,
    Resume,
    Analysis { symbol: String },
    News { symbol: String },
    Universe,
}

fn default_trade_limit() -> usize {
    DEFAULT_TRADE_LIMIT
}

impl OperatorCommand {
    /// Parse a chat-style command such as `/buy AAPL 500`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut parts = text.split_whitespace();
        let head = parts
            .next()
            .ok_or_else(|| "empty command".to_string())?
            .trim_start_matches('/')
            .to_lowercase();
        let arg = parts.next();

        let symbol = |arg: Option<&str>| -> Result<String, String> {
            let raw = arg.ok_or_else(|| format!("usage: /{} SYMBOL", head))?;
            clean_symbol(raw).ok_or_else(|| format!("invalid symbol: {}", raw))
        };

        match head.as_str() {
            "status" => Ok(Self::Status),
            "positions" => Ok(Self::Positions),
            "balance" => Ok(Self::Balance),
            "trades" => Ok(Self::Trades {
                limit: arg.and_then(|a| a.parse().ok()).unwrap_or(DEFAULT_TRADE_LIMIT),
            }),
            "signals" => Ok(Self::Signals),
            "buy" => {
                let symbol = symbol(arg)?;
                let value = parts
                    .next()
                    .and_then(|v| v.trim_start_matches('$').parse::<f64>().ok())
                    .filter(|v| v.is_finite() && *v > 0.0)
                    .ok_or_else(|| "usage: /buy SYMBOL AMOUNT".to_string())?;
                Ok(Self::Buy { symbol, value })
            }
            "sell" => Ok(Self::Sell { symbol: symbol(arg)? }),
            "close" => Ok(Self::Close { symbol: symbol(arg)? }),
            "closeall" | "close_all" => Ok(Self::CloseAll),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "analysis" => Ok(Self::Analysis { symbol: symbol(arg)? }),
            "news" => Ok(Self::News { symbol: symbol(arg)? }),
            "universe" => Ok(Self::Universe),
            other => Err(format!("unknown command: /{}", other)),
        }
    }

    /// Whether the command changes positions or pause state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Buy { .. } | Self::Sell { .. } | Self::Close { .. } | Self::CloseAll | Self::Pause | Self::Resume
        )
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "/status"),
            Self::Positions => write!(f, "/positions"),
            Self::Balance => write!(f, "/balance"),
            Self::Trades { limit } => write!(f, "/trades {}", limit),
            Self::Signals => write!(f, "/signals"),
            Self::Buy { symbol, value } => write!(f, "/buy {} {:.2}", symbol, value),
            Self::Sell { symbol } => write!(f, "/sell {}", symbol),
            Self::Close { symbol } => write!(f, "/close {}", symbol),
            Self::CloseAll => write!(f, "/closeall"),
            Self::Pause => write!(f, "/pause"),
            Self::Resume => write!(f, "/resume"),
            Self::Analysis { symbol } => write!(f, "/analysis {}", symbol),
            Self::News { symbol } => write!(f, "/news {}", symbol),
            Self::Universe => write!(f, "/universe"),
        }
    }
}

/// Answer to one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl CommandReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).unwrap_or_default();
        self
    }
}

/// A queued command and where to send the answer.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: OperatorCommand,
    pub reply: oneshot::Sender<CommandReply>,
}

/// Cloneable submit side of the command queue.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<CommandRequest>,
}

impl CommandSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CommandRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a command and wait for the scheduler to answer it.
    pub async fn submit(&self, command: OperatorCommand) -> TradingResult<CommandReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(CommandRequest { command, reply })
            .map_err(|e| TradingError::Validation(format!("command queue unavailable: {}", e)))?;

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TradingError::Validation("scheduler dropped the command".into())),
            Err(_) => Err(TradingError::Validation("timed out waiting for the scheduler".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(OperatorCommand::parse("/status").unwrap(), OperatorCommand::Status);
        assert_eq!(
            OperatorCommand::parse("/buy aapl $500").unwrap(),
            OperatorCommand::Buy {
                symbol: "AAPL".into(),
                value: 500.0
            }
        );
        assert_eq!(
            OperatorCommand::parse("/close brk.b").unwrap(),
            OperatorCommand::Close { symbol: "BRK-B".into() }
        );
        assert_eq!(
            OperatorCommand::parse("/trades").unwrap(),
            OperatorCommand::Trades { limit: 10 }
        );
        assert_eq!(OperatorCommand::parse("/closeall").unwrap(), OperatorCommand::CloseAll);
    }

    #[test]
    fn test_parse_errors() {
        assert!(OperatorCommand::parse("").is_err());
        assert!(OperatorCommand::parse("/buy AAPL").is_err());
        assert!(OperatorCommand::parse("/buy AAPL -5").is_err());
        assert!(OperatorCommand::parse("/sell").is_err());
        assert!(OperatorCommand::parse("/sell 1ABC").is_err());
        assert!(OperatorCommand::parse("/launch").is_err());
    }

    #[test]
    fn test_json_shape() {
        let cmd: OperatorCommand = serde_json::from_str(r#"{"command":"buy","symbol":"MSFT","value":250}"#).unwrap();
        assert_eq!(
            cmd,
            OperatorCommand::Buy {
                symbol: "MSFT".into(),
                value: 250.0
            }
        );
        let cmd: OperatorCommand = serde_json::from_str(r#"{"command":"trades"}"#).unwrap();
        assert_eq!(cmd, OperatorCommand::Trades { limit: 10 });
        assert!(cmd.to_string().starts_with("/trades"));
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let (sender, mut rx) = CommandSender::channel(4);
        let responder = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.command, OperatorCommand::Pause);
            req.reply.send(CommandReply::ok("paused")).unwrap();
        });
        let reply = sender.submit(OperatorCommand::Pause).await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.message, "paused");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_fails_when_receiver_gone() {
        let (sender, rx) = CommandSender::channel(1);
        drop(rx);
        assert!(sender.submit(OperatorCommand::Status).await.is_err());
    }
}
