use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{required, AppResult, AppState, Body};

use super::{ParticipantId, RoomId, RoomStore};

#[derive(Deserialize)]
pub(crate) struct VisibilityBody {
    uuid: Option<ParticipantId>,
    #[serde(alias = "isPrivate")]
    is_private: Option<bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct Visibility {
    room: RoomId,
    is_private: bool,
}

/// Only the creator may flip a room between private and public.
#[debug_handler(state = AppState)]
pub(crate) async fn set_visibility(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
    Body(VisibilityBody { uuid, is_private }): Body<VisibilityBody>,
) -> AppResult<Json<Visibility>> {
    let uuid = required(uuid, "uuid")?;
    let is_private = required(is_private, "is_private")?;

    let is_private = rooms
        .modify(room_id, |room| room.set_visibility(uuid, is_private))
        .await?;
    info!(room = %room_id, is_private, "visibility changed");

    Ok(Json(Visibility {
        room: room_id,
        is_private,
    }))
}
