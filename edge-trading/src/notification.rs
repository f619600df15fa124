//! Outbound notifications.
//!
//! The engine hands events to a [`Notifier`], which pushes them onto a
//! bounded queue. A dispatcher task renders and delivers them to Telegram.
//! Delivery failures are logged and dropped; the decision path never waits.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use edge_common::config::NotificationConfig;
use edge_common::util::{escape_html, truncate_with_ellipsis};

use crate::clock::WeekId;
use crate::strategy::{Signal, StrategyId};

/// Max characters of an error message that leave the process.
const ERROR_MESSAGE_CHARS: usize = 200;

/// Telegram caps messages at 4096 characters.
const REPLY_MESSAGE_CHARS: usize = 3500;

/// Events worth telling the operator about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    UniverseRefreshed {
        week_id: WeekId,
        count: usize,
    },
    CandidatesFound {
        week_id: WeekId,
        symbols: Vec<String>,
    },
    AnalysisComplete {
        week_id: WeekId,
        source: String,
        analyzed: usize,
        failed: usize,
    },
    SignalGenerated {
        signal: Signal,
    },
    PositionOpened {
        symbol: String,
        strategy: StrategyId,
        quantity: f64,
        price: f64,
        score: u8,
    },
    PositionClosed {
        symbol: String,
        strategy: StrategyId,
        price: f64,
        pnl: f64,
        pnl_pct: f64,
        reason: String,
    },
    /// Logged, never delivered
    NoTrade {
        symbol: String,
        strategy: StrategyId,
        reasons: Vec<String>,
    },
    NewsAlert {
        symbol: String,
        headline: String,
        sentiment: f64,
    },
    DailySummary {
        date: NaiveDate,
        open_positions: usize,
        trades: usize,
        realized_pnl: f64,
        free_cash: f64,
    },
    Error {
        context: String,
        message: String,
    },
    /// Answer to a command sent from the chat
    CommandReply {
        command: String,
        ok: bool,
        message: String,
    },
}

impl NotificationEvent {
    /// Wrap any error as a user-facing notification.
    pub fn error(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Error {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Telegram HTML body. `None` for events that are never delivered.
    pub fn render(&self) -> Option<String> {
        let text = match self {
            Self::UniverseRefreshed { week_id, count } => {
                format!("🌐 <b>Universe refreshed</b> ({})\n{} tradeable instruments", week_id, count)
            }
            Self::CandidatesFound { week_id, symbols } => {
                let list = if symbols.is_empty() {
                    "none".to_string()
                } else {
                    escape_html(&truncate_with_ellipsis(&symbols.join(", "), 300))
                };
                format!(
                    "📅 <b>Earnings candidates</b> ({})\n{} symbols: {}",
                    week_id,
                    symbols.len(),
                    list
                )
            }
            Self::AnalysisComplete {
                week_id,
                source,
                analyzed,
                failed,
            } => format!(
                "🧮 <b>Analysis complete</b> ({})\n{}: {} records, {} failed",
                week_id,
                escape_html(source),
                analyzed,
                failed
            ),
            Self::SignalGenerated { signal } => {
                let mut text = format!(
                    "📡 <b>{} {}</b> [{}]\nScore: {}/5\n{}",
                    signal.direction,
                    escape_html(&signal.symbol),
                    signal.strategy_id.display_name(),
                    signal.score,
                    escape_html(&signal.reason)
                );
                if let Some(stop) = signal.stop_loss {
                    text.push_str(&format!("\nStop: ${:.2}", stop));
                }
                if let Some(target) = signal.target_price {
                    text.push_str(&format!("\nTarget: ${:.2}", target));
                }
                text
            }
            Self::PositionOpened {
                symbol,
                strategy,
                quantity,
                price,
                score,
            } => format!(
                "✅ <b>Bought {}</b> [{}]\n{:.2} @ ${:.2} (score {}/5)",
                escape_html(symbol),
                strategy.display_name(),
                quantity,
                price,
                score
            ),
            Self::PositionClosed {
                symbol,
                strategy,
                price,
                pnl,
                pnl_pct,
                reason,
            } => {
                let icon = if *pnl >= 0.0 { "💰" } else { "🔻" };
                format!(
                    "{} <b>Sold {}</b> [{}]\n@ ${:.2}, P&amp;L ${:+.2} ({:+.1}%)\n{}",
                    icon,
                    escape_html(symbol),
                    strategy.display_name(),
                    price,
                    pnl,
                    pnl_pct,
                    escape_html(reason)
                )
            }
            Self::NoTrade { .. } => return None,
            Self::NewsAlert {
                symbol,
                headline,
                sentiment,
            } => format!(
                "📰 <b>News: {}</b> (sentiment {:+.2})\n{}",
                escape_html(symbol),
                sentiment,
                escape_html(&truncate_with_ellipsis(headline, 200))
            ),
            Self::DailySummary {
                date,
                open_positions,
                trades,
                realized_pnl,
                free_cash,
            } => format!(
                "📋 <b>Daily summary</b> {}\nOpen positions: {}\nTrades today: {}\nRealized P&amp;L: ${:+.2}\nFree cash: ${:.2}",
                date, open_positions, trades, realized_pnl, free_cash
            ),
            Self::Error { context, message } => format!(
                "⚠️ <b>{}</b>\n{}",
                escape_html(context),
                escape_html(&truncate_with_ellipsis(message, ERROR_MESSAGE_CHARS))
            ),
            Self::CommandReply { command, ok, message } => format!(
                "{} <b>{}</b>\n{}",
                if *ok { "✔️" } else { "❌" },
                escape_html(command),
                escape_html(&truncate_with_ellipsis(message, REPLY_MESSAGE_CHARS))
            ),
        };
        Some(text)
    }
}

// ============================================================================
// Notifier handle
// ============================================================================

/// Cheap, cloneable, fire-and-forget handle.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::Sender<NotificationEvent>>,
}

impl Notifier {
    /// Drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A notifier and the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NotificationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Start the Telegram dispatcher when configured, otherwise a disabled notifier.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: &NotificationConfig) -> Self {
        let Some(sender) = TelegramSender::from_config(config) else {
            info!("Notifications disabled");
            return Self::disabled();
        };
        let (notifier, rx) = Self::channel(config.queue_capacity);
        tokio::spawn(sender.run(rx));
        info!("Telegram notifications enabled");
        notifier
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event. Never blocks; drops with a warning when the queue is full.
    pub fn notify(&self, event: NotificationEvent) {
        if let NotificationEvent::NoTrade { symbol, strategy, reasons } = &event {
            debug!(symbol = %symbol, strategy = %strategy, reasons = %reasons.join("; "), "NO-TRADE");
            return;
        }
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => warn!("Notification queue full, dropping event"),
            Err(mpsc::error::TrySendError::Closed(_)) => debug!("Notification dispatcher stopped"),
        }
    }
}

// ============================================================================
// Telegram delivery
// ============================================================================

/// Telegram `sendMessage` client.
pub struct TelegramSender {
    client: reqwest::Client,
    url: String,
    chat_id: String,
    retry_count: u32,
    retry_delay: Duration,
}

impl TelegramSender {
    /// `None` unless enabled with both token and chat id.
    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let token = config.telegram_token.as_deref().filter(|t| !t.is_empty())?;
        let chat_id = config.chat_id.as_deref().filter(|c| !c.is_empty())?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Some(Self {
            client,
            url: format!("{}/bot{}/sendMessage", config.api_base.trim_end_matches('/'), token),
            chat_id: chat_id.to_string(),
            retry_count: config.retry_count.max(1),
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Send one HTML message, retrying with a linear backoff.
    pub async fn send(&self, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let mut last_error = None;
        for attempt in 1..=self.retry_count {
            match self.client.post(&self.url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Telegram message delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    last_error = Some(format!("HTTP {}: {}", status, text));
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        bail!(
            "Telegram delivery failed after {} attempts: {}",
            self.retry_count,
            last_error.unwrap_or_default()
        )
    }

    /// Drain the queue until every sender is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<NotificationEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(text) = event.render() else {
                continue;
            };
            if let Err(e) = self.send(&text).await {
                warn!(error = %e, "Notification dropped");
            }
        }
        debug!("Notification dispatcher exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> NotificationConfig {
        NotificationConfig {
            enabled: true,
            telegram_token: Some("TOKEN".into()),
            chat_id: Some("42".into()),
            api_base: server.uri(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_trade_is_silent() {
        let event = NotificationEvent::NoTrade {
            symbol: "AAPL".into(),
            strategy: StrategyId::Breakout,
            reasons: vec!["low volume".into()],
        };
        assert!(event.render().is_none());
    }

    #[test]
    fn test_error_message_truncated_and_escaped() {
        let long = format!("<boom> {}", "x".repeat(500));
        let text = NotificationEvent::error("Cycle failed", long).render().unwrap();
        assert!(text.contains("&lt;boom&gt;"));
        assert!(text.ends_with("..."));
        assert!(text.chars().count() < 260);
    }

    #[test]
    fn test_position_closed_render() {
        let text = NotificationEvent::PositionClosed {
            symbol: "MSFT".into(),
            strategy: StrategyId::MeanReversion,
            price: 95.0,
            pnl: -50.0,
            pnl_pct: -5.0,
            reason: "Stop loss: -5.0%".into(),
        }
        .render()
        .unwrap();
        assert!(text.contains("Sold MSFT"));
        assert!(text.contains("-50.00"));
        assert!(text.contains("Mean Reversion"));
    }

    #[test]
    fn test_command_reply_render() {
        let text = NotificationEvent::CommandReply {
            command: "/close AAPL".into(),
            ok: false,
            message: "No open position in <AAPL>".into(),
        }
        .render()
        .unwrap();
        assert!(text.starts_with("❌ <b>/close AAPL</b>"));
        assert!(text.contains("&lt;AAPL&gt;"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (notifier, mut rx) = Notifier::channel(1);
        notifier.notify(NotificationEvent::error("a", "first"));
        notifier.notify(NotificationEvent::error("b", "second"));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_without_token() {
        let config = NotificationConfig {
            enabled: true,
            chat_id: Some("42".into()),
            ..Default::default()
        };
        assert!(TelegramSender::from_config(&config).is_none());
        assert!(!Notifier::disabled().is_enabled());
    }

    #[tokio::test]
    async fn test_send_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({"chat_id": "42", "parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let sender = TelegramSender::from_config(&config(&server))
            .unwrap()
            .with_retry_delay(Duration::from_millis(5));
        sender.send("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let sender = TelegramSender::from_config(&config(&server))
            .unwrap()
            .with_retry_delay(Duration::from_millis(5));
        assert!(sender.send("hello").await.is_err());
    }
}
