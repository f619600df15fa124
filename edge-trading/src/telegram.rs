//! Telegram command listener.
//!
//! Long-polls `getUpdates`, keeps only text messages from the configured
//! chat that start with `/`, parses them as [`OperatorCommand`]s and queues
//! them for the scheduler. Answers go back through the [`Notifier`].

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use edge_common::config::NotificationConfig;

use crate::commands::{CommandSender, OperatorCommand};
use crate::notification::{NotificationEvent, Notifier};

/// Pause after a failed poll.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Polls the bot for operator commands.
pub struct TelegramCommandListener {
    client: reqwest::Client,
    url: String,
    chat_id: String,
    poll_timeout_secs: u64,
}

impl TelegramCommandListener {
    /// `None` unless notifications and command listening are both enabled
    /// with a token and a chat id.
    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        if !config.enabled || !config.listen_commands {
            return None;
        }
        let token = config.telegram_token.as_deref().filter(|t| !t.is_empty())?;
        let chat_id = config.chat_id.as_deref().filter(|c| !c.is_empty())?;

        // The HTTP timeout has to outlast the long poll
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Some(Self {
            client,
            url: format!("{}/bot{}/getUpdates", config.api_base.trim_end_matches('/'), token),
            chat_id: chat_id.to_string(),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    /// One `getUpdates` call. Returns the next offset and the command texts
    /// from the configured chat, in arrival order.
    pub async fn poll(&self, offset: i64) -> Result<(i64, Vec<String>)> {
        let body = json!({
            "offset": offset,
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("getUpdates returned HTTP {}", status);
        }
        let data: Value = response.json().await?;
        Ok(self.commands_from_updates(&data, offset))
    }

    fn commands_from_updates(&self, data: &Value, mut offset: i64) -> (i64, Vec<String>) {
        let mut texts = Vec::new();
        let Some(updates) = data.get("result").and_then(Value::as_array) else {
            return (offset, texts);
        };

        for update in updates {
            if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                offset = offset.max(id + 1);
            }
            let Some(message) = update.get("message") else {
                continue;
            };
            let chat = message
                .pointer("/chat/id")
                .and_then(|id| id.as_i64().map(|n| n.to_string()).or_else(|| id.as_str().map(str::to_string)));
            if chat.as_deref() != Some(self.chat_id.as_str()) {
                warn!(chat = chat.as_deref().unwrap_or("unknown"), "Ignoring message from unknown chat");
                continue;
            }
            let Some(text) = message.get("text").and_then(Value::as_str).map(str::trim) else {
                continue;
            };
            if text.starts_with('/') {
                texts.push(text.to_string());
            }
        }
        (offset, texts)
    }

    /// Parse, submit and answer one command text.
    pub async fn dispatch(text: &str, commands: &CommandSender, notifier: &Notifier) {
        // `/status@SomeBot` in group chats
        let text = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => format!("{} {}", strip_bot_suffix(head), rest),
            None => strip_bot_suffix(text).to_string(),
        };
        let head = text.split_whitespace().next().unwrap_or_default().to_string();

        let event = match OperatorCommand::parse(&text) {
            Ok(command) => {
                info!(command = %command, "Operator command from Telegram");
                match commands.submit(command.clone()).await {
                    Ok(reply) => NotificationEvent::CommandReply {
                        command: command.to_string(),
                        ok: reply.ok,
                        message: reply.message,
                    },
                    Err(e) => NotificationEvent::CommandReply {
                        command: command.to_string(),
                        ok: false,
                        message: e.to_string(),
                    },
                }
            }
            Err(usage) => NotificationEvent::CommandReply {
                command: head,
                ok: false,
                message: usage,
            },
        };
        notifier.notify(event);
    }

    /// Poll forever, submitting every command in order.
    pub async fn run(self, commands: CommandSender, notifier: Notifier) {
        info!("Telegram command listener started");
        let mut offset = 0;
        loop {
            match self.poll(offset).await {
                Ok((next, texts)) => {
                    offset = next;
                    for text in texts {
                        Self::dispatch(&text, &commands, &notifier).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Telegram poll failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

fn strip_bot_suffix(head: &str) -> &str {
    head.split_once('@').map_or(head, |(cmd, _)| cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandReply;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> NotificationConfig {
        NotificationConfig {
            enabled: true,
            telegram_token: Some("TOKEN".into()),
            chat_id: Some("42".into()),
            api_base: server.uri(),
            poll_timeout_secs: 0,
            ..Default::default()
        }
    }

    fn update(id: i64, chat: i64, text: &str) -> Value {
        json!({
            "update_id": id,
            "message": {"chat": {"id": chat}, "from": {"id": chat}, "text": text}
        })
    }

    #[tokio::test]
    async fn test_poll_keeps_commands_from_configured_chat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({"offset": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    update(7, 42, "/pause"),
                    update(8, 99, "/closeall"),
                    update(9, 42, "hello"),
                    update(10, 42, " /buy AAPL 500 "),
                ]
            })))
            .mount(&server)
            .await;

        let listener = TelegramCommandListener::from_config(&config(&server)).unwrap();
        let (offset, texts) = listener.poll(7).await.unwrap();
        assert_eq!(offset, 11);
        assert_eq!(texts, vec!["/pause".to_string(), "/buy AAPL 500".to_string()]);
    }

    #[tokio::test]
    async fn test_poll_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        let listener = TelegramCommandListener::from_config(&config(&server)).unwrap();
        assert!(listener.poll(0).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_submits_and_replies() {
        let (commands, mut rx) = CommandSender::channel(4);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                assert_eq!(req.command, OperatorCommand::Pause);
                let _ = req.reply.send(CommandReply::ok("Paused"));
            }
        });
        let (notifier, mut events) = Notifier::channel(4);

        TelegramCommandListener::dispatch("/pause@EdgeBot", &commands, &notifier).await;
        match events.recv().await.unwrap() {
            NotificationEvent::CommandReply { command, ok, message } => {
                assert_eq!(command, "/pause");
                assert!(ok);
                assert_eq!(message, "Paused");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_reports_usage_without_submitting() {
        let (commands, mut rx) = CommandSender::channel(4);
        let (notifier, mut events) = Notifier::channel(4);

        TelegramCommandListener::dispatch("/buy AAPL", &commands, &notifier).await;
        assert!(rx.try_recv().is_err());
        match events.recv().await.unwrap() {
            NotificationEvent::CommandReply { ok, message, .. } => {
                assert!(!ok);
                assert!(message.starts_with("usage"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_disabled_without_listen_flag() {
        let config = NotificationConfig {
            enabled: true,
            telegram_token: Some("TOKEN".into()),
            chat_id: Some("42".into()),
            listen_commands: false,
            ..Default::default()
        };
        assert!(TelegramCommandListener::from_config(&config).is_none());
    }
}
