use std::time::Duration;

use axum::{
    debug_handler,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{required, session::Seats, AppResult, AppState, Body};

use super::{now, ParticipantId, RelayEvent, RoomError, RoomHub, RoomId, RoomStore, SlotRef, Sweep};

#[derive(Debug, Serialize)]
pub(crate) struct Seated {
    pub(crate) room: RoomId,
    pub(crate) uuid: ParticipantId,
    pub(crate) slot: SlotRef,
}

#[derive(Deserialize)]
pub(crate) struct DisconnectBody {
    uuid: Option<ParticipantId>,
}

/// Tells subscribed peers which label the newcomer gets.
pub(super) fn announce(hub: &RoomHub, room_id: RoomId, user_id: ParticipantId, slot: SlotRef) {
    hub.publish(
        room_id,
        RelayEvent::NewUser {
            user_id,
            user_index: slot.index(),
        },
    );
}

/// The seat this browser already holds in the room, if that participant is
/// still online. Its lease is renewed; a seat that went stale is forgotten.
pub(super) async fn reclaim(rooms: &RoomStore, seats: &Seats, room_id: RoomId) -> AppResult<Option<Seated>> {
    let Some(uuid) = seats.get(room_id).await? else {
        return Ok(None);
    };

    match rooms.modify(room_id, |room| room.touch(uuid, now())).await {
        Ok(slot) => {
            debug!(room = %room_id, participant = %uuid, "reusing remembered seat");
            Ok(Some(Seated {
                room: room_id,
                uuid,
                slot,
            }))
        }
        Err(RoomError::NotAMember) => {
            seats.forget(room_id).await?;
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn connect(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    seats: Seats,
) -> AppResult<Json<Seated>> {
    if let Some(seated) = reclaim(&rooms, &seats, room_id).await? {
        return Ok(Json(seated));
    }

    let (uuid, slot) = rooms.modify(room_id, |room| room.admit(now())).await?;
    announce(&hub, room_id, uuid, slot);
    seats.remember(room_id, uuid).await?;
    info!(room = %room_id, participant = %uuid, slot = slot.index(), "participant connected");

    Ok(Json(Seated {
        room: room_id,
        uuid,
        slot,
    }))
}

/// Best effort. Whatever happens to the room, the caller gets `ok`.
#[debug_handler(state = AppState)]
pub(crate) async fn disconnect(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    seats: Seats,
    Body(DisconnectBody { uuid }): Body<DisconnectBody>,
) -> AppResult<&'static str> {
    let uuid = required(uuid, "uuid")?;

    match rooms.modify(room_id, |room| room.leave(uuid)).await {
        Ok(0) => {
            hub.close(room_id);
            info!(room = %room_id, participant = %uuid, "last participant left");
        }
        Ok(remaining) => {
            hub.publish(room_id, RelayEvent::UserLeft { user_id: uuid });
            info!(room = %room_id, participant = %uuid, remaining, "participant disconnected");
        }
        Err(err @ (RoomError::NotAMember | RoomError::NotFound | RoomError::RoomGone)) => {
            debug!(room = %room_id, participant = %uuid, %err, "ignoring disconnect");
        }
        Err(err) => {
            warn!(room = %room_id, participant = %uuid, %err, "disconnect failed");
        }
    }

    if let Err(err) = seats.forget(room_id).await {
        warn!(room = %room_id, error = ?err, "could not forget seat");
    }
    Ok("ok")
}

/// Periodically evicts members whose lease ran out, reaps emptied rooms and
/// drops broadcast channels nobody listens to. Without a lease only the
/// channels are pruned.
pub fn spawn_reaper(rooms: RoomStore, hub: RoomHub, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Sweep { evicted, deleted } = match rooms.sweep().await {
                Ok(sweep) => sweep,
                Err(err) => {
                    warn!(%err, "room sweep failed");
                    continue;
                }
            };

            for (room_id, user_id) in &evicted {
                hub.publish(*room_id, RelayEvent::UserLeft { user_id: *user_id });
            }
            for room_id in &deleted {
                hub.close(*room_id);
            }
            let pruned = hub.prune();

            if !evicted.is_empty() || !deleted.is_empty() {
                info!(evicted = evicted.len(), deleted = deleted.len(), pruned, "swept rooms");
            }
        }
    })
}
