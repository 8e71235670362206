//! HTTP surface: game creation, event dispatch, and the read endpoints.

use crate::db;
use crate::engine::{self, EngineContext, EngineError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({"detail": self.to_string()}))).into_response()
    }
}

fn parse_game_id(game_id: &str) -> Result<String, EngineError> {
    Uuid::parse_str(game_id)
        .map(|id| id.to_string())
        .map_err(|_| EngineError::Validation("Invalid game id".to_string()))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateGameRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceRequest {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptQuery {
    #[serde(default)]
    pub visible_to_human: Option<bool>,
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn create_game(
    State(ctx): State<Arc<EngineContext>>,
    body: Option<Json<CreateGameRequest>>,
) -> Result<Json<Value>, EngineError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if let Some(user_id) = &request.user_id {
        Uuid::parse_str(user_id)
            .map_err(|_| EngineError::Validation("Invalid user_id".to_string()))?;
    }
    let result = engine::create_game(&ctx, request.user_id.as_deref())?;
    Ok(Json(json!({"game_id": result.game_id, "state": result.state})))
}

async fn advance_game(
    State(ctx): State<Arc<EngineContext>>,
    Path(game_id): Path<String>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<Value>, EngineError> {
    let game_id = parse_game_id(&game_id)?;
    let result = engine::advance(&ctx, &game_id, &request.event, &request.payload).await?;
    Ok(Json(json!({"game_id": result.game_id, "state": result.state})))
}

async fn get_game(
    State(ctx): State<Arc<EngineContext>>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, EngineError> {
    let game_id = parse_game_id(&game_id)?;
    let loaded = ctx.db.read(|conn| db::fetch_game_with_state(conn, &game_id))?;
    let Some((game, state)) = loaded else {
        return Err(EngineError::NotFound("Game not found".to_string()));
    };
    Ok(Json(json!({"game": game, "state": state})))
}

async fn get_transcript(
    State(ctx): State<Arc<EngineContext>>,
    Path(game_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Json<Value>, EngineError> {
    let game_id = parse_game_id(&game_id)?;
    let entries = ctx.db.read(|conn| -> Result<_, EngineError> {
        if !db::game_exists(conn, &game_id)? {
            return Err(EngineError::NotFound("Game not found".to_string()));
        }
        Ok(db::fetch_transcript(conn, &game_id, query.visible_to_human)?)
    })?;
    Ok(Json(json!(entries)))
}

async fn get_review(
    State(ctx): State<Arc<EngineContext>>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, EngineError> {
    let game_id = parse_game_id(&game_id)?;
    let (transcript, votes) = ctx.db.read(|conn| -> Result<_, EngineError> {
        if !db::game_exists(conn, &game_id)? {
            return Err(EngineError::NotFound("Game not found".to_string()));
        }
        let transcript = db::fetch_review_transcript(conn, &game_id)?;
        let votes = db::fetch_votes(conn, &game_id)?;
        Ok((transcript, votes))
    })?;
    Ok(Json(json!({"game_id": game_id, "transcript": transcript, "votes": votes})))
}

pub fn build_router(ctx: Arc<EngineContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/games", post(create_game))
        .route("/games/:game_id/advance", post(advance_game))
        .route("/games/:game_id", get(get_game))
        .route("/games/:game_id/transcript", get(get_transcript))
        .route("/games/:game_id/review", get(get_review))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
