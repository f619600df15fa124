//! HTTP status API.
//!
//! Read-only endpoints answer from the store and the scheduler's published
//! status. `POST /api/v1/commands` is the only mutation path and goes
//! through the scheduler's command queue.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::analysis::AnalysisRecord;
use crate::clock::WeekId;
use crate::commands::{CommandReply, CommandSender, OperatorCommand};
use crate::execution::Position;
use crate::scheduler::SchedulerStatus;
use crate::store::Store;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub status: watch::Receiver<SchedulerStatus>,
    pub commands: CommandSender,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Serialize)]
pub struct PositionsResponse {
    pub positions: Vec<Position>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub week_id: WeekId,
    pub records: Vec<AnalysisRecord>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisQuery {
    /// `earnings` or a strategy id
    pub source: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Either a chat-style line or a structured command.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CommandBody {
    Text { text: String },
    Command(OperatorCommand),
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

// ============================================================================
// Route Handlers
// ============================================================================

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "edge-trading".to_string(),
    })
}

pub async fn get_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.status.borrow().clone())
}

/// Persisted open positions.
pub async fn get_positions(State(state): State<AppState>) -> Result<Json<PositionsResponse>, ApiError> {
    let positions = state.store.load_positions().map_err(|e| {
        tracing::warn!(error = %e, "Failed to load positions");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load positions")
    })?;
    let count = positions.len();
    Ok(Json(PositionsResponse { positions, count }))
}

/// Frozen analysis for a week, optionally filtered.
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(week_id): Path<String>,
    Query(query): Query<AnalysisQuery>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let week = WeekId::parse(&week_id)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, format!("invalid week id: {}", week_id)))?;

    let records = match &query.source {
        Some(source) => state.store.analysis_for(source, &week),
        None => state.store.analysis_week(&week),
    }
    .map_err(|e| {
        tracing::warn!(week = %week, error = %e, "Failed to load analysis");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to load analysis")
    })?;

    let records: Vec<AnalysisRecord> = match &query.symbol {
        Some(symbol) => {
            let symbol = symbol.to_uppercase();
            records.into_iter().filter(|r| r.symbol == symbol).collect()
        }
        None => records,
    };
    let count = records.len();
    Ok(Json(AnalysisResponse {
        week_id: week,
        records,
        count,
    }))
}

/// Queue a command and wait for the scheduler's answer.
pub async fn post_command(
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Json<CommandReply>, ApiError> {
    let command = match body {
        CommandBody::Text { text } => {
            OperatorCommand::parse(&text).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?
        }
        CommandBody::Command(command) => command,
    };
    tracing::info!(command = %command, "Operator command received");

    let reply = state
        .commands
        .submit(command)
        .await
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(reply))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/positions", get(get_positions))
        .route("/api/v1/analysis/:week_id", get(get_analysis))
        .route("/api/v1/commands", post(post_command))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Behavior;
    use crate::clock::SessionPhase;
    use crate::strategy::{Components, StrategyId};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    fn status() -> SchedulerStatus {
        SchedulerStatus {
            phase: SessionPhase::Weekend,
            week_id: WeekId::parse("2026-W10").unwrap(),
            paper_mode: true,
            broker: "paper",
            paused: false,
            loss_halted: false,
            open_positions: 0,
            symbols: Vec::new(),
            weekend_running: false,
            last_cycle: None,
        }
    }

    fn test_app() -> (Router, Store, tokio::sync::mpsc::Receiver<crate::commands::CommandRequest>) {
        let store = Store::in_memory().unwrap();
        let (_tx, status) = watch::channel(status());
        let (commands, rx) = CommandSender::channel(4);
        let app = build_router(AppState {
            store: store.clone(),
            status,
            commands,
        });
        (app, store, rx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _, _rx) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reflects_scheduler() {
        let (app, _, _rx) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["week_id"], "2026-W10");
        assert_eq!(json["broker"], "paper");
    }

    #[tokio::test]
    async fn test_positions_from_store() {
        let (app, store, _rx) = test_app();
        store
            .save_position(&Position::new("AAPL", StrategyId::Breakout, 2.0, 100.0, Utc::now(), 4, "test".into()))
            .unwrap();
        let response = app
            .oneshot(Request::builder().uri("/api/v1/positions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["positions"][0]["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn test_analysis_by_week() {
        let (app, store, _rx) = test_app();
        let week = WeekId::parse("2026-W10").unwrap();
        store
            .insert_analysis(&[
                AnalysisRecord::new("earnings", "AAPL", &week, Components::new(), 4, Behavior::Fade),
                AnalysisRecord::new("breakout", "MSFT", &week, Components::new(), 3, Behavior::Unknown),
            ])
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/analysis/2026-W10?source=earnings")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["records"][0]["symbol"], "AAPL");

        let response = app
            .oneshot(Request::builder().uri("/api/v1/analysis/bogus").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_command_goes_through_queue() {
        let (app, _, mut rx) = test_app();
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.command, OperatorCommand::Pause);
            request.reply.send(CommandReply::ok("paused")).unwrap();
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "/pause"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_command_text() {
        let (app, _, _rx) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/commands")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "/launch rockets"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
