//! User presence values and the presence endpoints.
//!
//! Presence itself lives in the hub registry: a user is online exactly while
//! they have a registered connection. A connected user may switch between
//! online and away; offline is only reached by disconnecting.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::auth::AuthUser;
use crate::db::models::UserId;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Away,
    #[default]
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub user_id: UserId,
    pub status: UserStatus,
}

/// GET /api/presence returns everyone currently connected. JWT auth required.
pub async fn get_presence(
    State(state): State<AppState>,
    _caller: AuthUser,
) -> Json<Vec<PresenceResponse>> {
    let entries = state
        .hub
        .online_user_ids()
        .into_iter()
        .map(|user_id| PresenceResponse {
            user_id,
            status: state.hub.user_status(user_id),
        })
        .collect();

    Json(entries)
}

/// GET /api/presence/{user_id} returns one user's status, `offline` if unknown.
pub async fn get_user_presence(
    State(state): State<AppState>,
    _caller: AuthUser,
    Path(user_id): Path<UserId>,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        user_id,
        status: state.hub.user_status(user_id),
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdatePresenceRequest {
    pub status: UserStatus,
}

/// PUT /api/presence sets the caller's own status to `online` or `away`.
/// The caller must hold a live WebSocket connection.
pub async fn update_presence(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(req): Json<UpdatePresenceRequest>,
) -> Result<Json<PresenceResponse>, StatusCode> {
    if req.status == UserStatus::Offline {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !state.hub.is_online(user_id) {
        return Err(StatusCode::CONFLICT);
    }

    if state.hub.set_status(user_id, req.status) {
        tracing::info!(user_id, status = %req.status, "Presence updated");
    }

    Ok(Json(PresenceResponse {
        user_id,
        status: state.hub.user_status(user_id),
    }))
}
