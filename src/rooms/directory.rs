use std::sync::Arc;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{Path, State},
    Json,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{Config, RelayMode},
    parse_body, required_str,
    session::Seats,
    AppError, AppResult, AppState, Body,
};

use super::{
    now,
    presence::{announce, reclaim, Seated},
    Room, RoomError, RoomHub, RoomId, RoomStore, SlotRef, MAX_CAPACITY, MIN_CAPACITY,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;
const CODE_ATTEMPTS: usize = 4;
const MAX_CODE_LEN: usize = 32;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CreateRoomBody {
    join_code: Option<String>,
    capacity: Option<usize>,
}

#[derive(Serialize)]
pub(crate) struct Created {
    #[serde(flatten)]
    seated: Seated,
    join_code: Option<String>,
    is_private: bool,
    capacity: usize,
    relay: RelayMode,
    poll_ms: Option<u64>,
}

#[derive(Deserialize)]
pub(crate) struct JoinBody {
    code: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct RoomInfo {
    room: RoomId,
    join_code: Option<String>,
    is_private: bool,
    capacity: usize,
    online: usize,
    occupied: Vec<bool>,
}

fn validate_join_code(code: String) -> AppResult<String> {
    let valid = !code.is_empty()
        && code.len() <= MAX_CODE_LEN
        && code.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    if valid {
        Ok(code)
    } else {
        Err(AppError::Invalid(format!(
            "join_code must be 1 to {MAX_CODE_LEN} letters, digits, '-' or '_'"
        )))
    }
}

fn generate_join_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

async fn create_with_generated_code(rooms: &RoomStore, capacity: usize) -> Result<Room, RoomError> {
    for _ in 0..CODE_ATTEMPTS {
        match rooms.create(capacity, Some(generate_join_code())).await {
            Err(RoomError::CodeTaken) => continue,
            result => return result,
        }
    }

    warn!("no free join code after {CODE_ATTEMPTS} draws, creating room without one");
    rooms.create(capacity, None).await
}

#[debug_handler(state = AppState)]
pub(crate) async fn create_room(
    State(rooms): State<RoomStore>,
    State(config): State<Arc<Config>>,
    seats: Seats,
    body: Bytes,
) -> AppResult<Json<Created>> {
    let CreateRoomBody { join_code, capacity } = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRoomBody::default()
    } else {
        parse_body(&body)?
    };

    let capacity = capacity.unwrap_or(config.default_capacity);
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
        return Err(AppError::Invalid(format!(
            "capacity must be between {MIN_CAPACITY} and {MAX_CAPACITY}"
        )));
    }
    let join_code = join_code.map(validate_join_code).transpose()?;

    let room = match join_code {
        Some(code) => rooms.create(capacity, Some(code)).await?,
        None if config.auto_join_code => create_with_generated_code(&rooms, capacity).await?,
        None => rooms.create(capacity, None).await?,
    };
    seats.remember(room.id, room.creator).await?;

    Ok(Json(Created {
        seated: Seated {
            room: room.id,
            uuid: room.creator,
            slot: SlotRef(0),
        },
        capacity: room.capacity(),
        is_private: room.is_private,
        join_code: room.join_code,
        relay: config.relay,
        poll_ms: (config.relay == RelayMode::Pull).then_some(config.poll_ms),
    }))
}

/// Seats the caller in the lowest-id public room that still has a free slot,
/// or hands back a seat they already hold there.
#[debug_handler(state = AppState)]
pub(crate) async fn join_random(
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    seats: Seats,
) -> AppResult<Json<Seated>> {
    let mut after = None;
    loop {
        let candidate = rooms.find_public_room_after(after).await?;
        match reclaim(&rooms, &seats, candidate.id).await {
            Ok(Some(seated)) => return Ok(Json(seated)),
            Ok(None) => {}
            Err(AppError::Room(RoomError::NotFound | RoomError::RoomGone)) => {
                after = Some(candidate.id);
                continue;
            }
            Err(err) => return Err(err),
        }

        match rooms.modify(candidate.id, |room| room.admit_public(now())).await {
            Ok((uuid, slot)) => {
                announce(&hub, candidate.id, uuid, slot);
                seats.remember(candidate.id, uuid).await?;
                info!(room = %candidate.id, participant = %uuid, slot = slot.index(), "joined random room");
                return Ok(Json(Seated {
                    room: candidate.id,
                    uuid,
                    slot,
                }));
            }
            Err(RoomError::RoomFull | RoomError::NotFound | RoomError::RoomGone) => {
                after = Some(candidate.id);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn join_by_code(
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    seats: Seats,
    Body(JoinBody { code }): Body<JoinBody>,
) -> AppResult<Json<Seated>> {
    let code = required_str(code, "code")?;
    let room = rooms.find_by_join_code(&code).await?;
    if let Some(seated) = reclaim(&rooms, &seats, room.id).await? {
        return Ok(Json(seated));
    }

    let (uuid, slot) = rooms.modify(room.id, |room| room.admit(now())).await?;
    announce(&hub, room.id, uuid, slot);
    seats.remember(room.id, uuid).await?;
    info!(room = %room.id, participant = %uuid, slot = slot.index(), "joined by code");

    Ok(Json(Seated {
        room: room.id,
        uuid,
        slot,
    }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_info(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
) -> AppResult<Json<RoomInfo>> {
    let room = rooms.find_by_id(room_id).await?;

    Ok(Json(RoomInfo {
        room: room.id,
        is_private: room.is_private,
        capacity: room.capacity(),
        online: room.online_count(),
        occupied: room.slots.iter().map(Option::is_some).collect(),
        join_code: room.join_code,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_use_the_unambiguous_alphabet() {
        for _ in 0..64 {
            let code = generate_join_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            assert!(validate_join_code(code).is_ok());
        }
    }

    #[test]
    fn join_codes_are_validated() {
        assert!(validate_join_code("movie-night_2".to_owned()).is_ok());
        assert!(validate_join_code(String::new()).is_err());
        assert!(validate_join_code("has space".to_owned()).is_err());
        assert!(validate_join_code("x".repeat(MAX_CODE_LEN + 1)).is_err());
    }
}
