use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::SharedConfig;
use crate::desk::units::{format_number, Height, HeightAndSpeed};
use crate::desk::Desk;

/// Shared state behind every REST handler.
#[derive(Clone)]
pub struct AppState {
    pub desk: Arc<Desk>,
    pub config: SharedConfig,
    pub telemetry: watch::Receiver<HeightAndSpeed>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rest/desk", get(get_desk).post(post_desk))
        .route(
            "/rest/desk/height",
            get(get_desk_height).post(post_desk_height),
        )
        .route("/rest/desk/speed", get(get_desk_speed))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct DeskDto {
    height: f64,
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct DeskRequest {
    height: f64,
}

async fn get_desk(State(state): State<AppState>) -> Json<DeskDto> {
    let snapshot = *state.telemetry.borrow();
    Json(DeskDto {
        height: snapshot.height.human(),
        speed: snapshot.speed.human(),
    })
}

async fn post_desk(State(state): State<AppState>, body: String) -> StatusCode {
    log::debug!("POST /rest/desk with {:?}", body);
    let Ok(request) = serde_json::from_str::<DeskRequest>(&body) else {
        return StatusCode::BAD_REQUEST;
    };
    dispatch_move(&state, request.height).await
}

async fn get_desk_height(State(state): State<AppState>) -> String {
    format_number(state.telemetry.borrow().height.human())
}

async fn post_desk_height(State(state): State<AppState>, body: String) -> StatusCode {
    log::debug!("POST /rest/desk/height with {:?}", body);
    let Ok(target) = body.trim().parse::<f64>() else {
        return StatusCode::BAD_REQUEST;
    };
    dispatch_move(&state, target).await
}

async fn get_desk_speed(State(state): State<AppState>) -> String {
    format_number(state.telemetry.borrow().speed.human())
}

/// Validate the target against the configured range and hand it to the
/// driver. The move runs asynchronously; 202 only means "accepted".
async fn dispatch_move(state: &AppState, target_mm: f64) -> StatusCode {
    if !target_mm.is_finite() {
        return StatusCode::BAD_REQUEST;
    }

    let (base_height, max_height, allow_downward) = {
        let config = state.config.read().await;
        let base_height = config.base_height.unwrap_or(0);
        (
            base_height,
            config.max_height.unwrap_or(base_height + 10),
            config.allow_downward_movement,
        )
    };

    if target_mm < base_height as f64 || target_mm > max_height as f64 {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }
    if !allow_downward && target_mm < state.telemetry.borrow().height.human() {
        return StatusCode::UNPROCESSABLE_ENTITY;
    }

    let target = Height::from_human(target_mm, base_height);
    log::info!("Moving to height of {}mm", format_number(target.human()));

    let desk = state.desk.clone();
    tokio::spawn(async move {
        if let Err(e) = desk.move_to(target).await {
            log::error!("Move failed: {}", e);
        }
    });

    StatusCode::ACCEPTED
}
