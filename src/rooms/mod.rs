mod directory;
mod hub;
mod msg;
mod presence;
mod room;
mod store;
mod visibility;
mod ws;

use axum::{routing::{get, post}, Router};
use time::OffsetDateTime;

use crate::{config::RelayMode, AppState};

pub use hub::{ClientFrame, RelayEvent, RoomHub};
pub use msg::Truncation;
pub use presence::spawn_reaper;
pub use room::{ParticipantId, Room, RoomError, RoomId, Slot, SlotRef, MAX_CAPACITY, MIN_CAPACITY};
pub use store::{RoomStore, Sweep};

pub fn router(relay: RelayMode) -> Router<AppState> {
    let router = Router::new()
        .route("/", post(directory::create_room))
        .route("/random", post(directory::join_random))
        .route("/join", post(directory::join_by_code))
        .route("/{room}", get(directory::room_info))
        .route("/{room}/connect", post(presence::connect))
        .route("/{room}/disconnect", post(presence::disconnect))
        .route("/{room}/message", post(msg::send_message))
        .route("/{room}/visibility", post(visibility::set_visibility));

    match relay {
        RelayMode::Pull => router.route("/{room}/fetch", post(msg::fetch_message)),
        RelayMode::Push => router.route("/{room}/ws", get(ws::room_ws)),
    }
}

/// Unix seconds, the unit member leases are kept in.
pub(crate) fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
