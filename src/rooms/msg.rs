use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::{Config, RelayMode},
    required, AppResult, AppState, Body,
};

use super::{now, ParticipantId, RelayEvent, RoomHub, RoomId, RoomStore, SlotRef};

/// How much of a participant's composed text is relayed: the last `lines`
/// lines, then at most the last `max_chars` characters of those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub lines: usize,
    pub max_chars: usize,
}

impl Default for Truncation {
    fn default() -> Self {
        Truncation {
            lines: 3,
            max_chars: 512,
        }
    }
}

impl Truncation {
    #[cfg(test)]
    pub const LAST_LINE: Truncation = Truncation {
        lines: 1,
        max_chars: 512,
    };

    pub fn apply(&self, text: &str) -> String {
        // a trailing newline leaves an empty last line, which is where the cursor is
        let start = text
            .match_indices('\n')
            .rev()
            .nth(self.lines.saturating_sub(1))
            .map_or(0, |(at, _)| at + 1);
        let tail = &text[start..];

        let excess = tail.chars().count().saturating_sub(self.max_chars);
        tail.chars().skip(excess).collect()
    }
}

#[derive(Deserialize)]
pub(crate) struct SendMessageBody {
    uuid: Option<ParticipantId>,
    message: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FetchMessageBody {
    uuid: Option<ParticipantId>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PeerMessage {
    slot: SlotRef,
    message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct Fetched {
    /// First peer's fragment, for two-seat rooms.
    message: String,
    peers: Vec<PeerMessage>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_message(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    State(config): State<Arc<Config>>,
    Body(SendMessageBody { uuid, message }): Body<SendMessageBody>,
) -> AppResult<StatusCode> {
    let uuid = required(uuid, "uuid")?;
    let message = config.truncation.apply(&required(message, "message")?);

    match config.relay {
        RelayMode::Pull => {
            rooms
                .modify(room_id, |room| room.set_message(uuid, message.clone(), now()))
                .await?;
            Ok(StatusCode::NO_CONTENT)
        }
        RelayMode::Push => {
            publish_fragment(&rooms, &hub, room_id, uuid, message).await;
            Ok(StatusCode::ACCEPTED)
        }
    }
}

/// Fire and forget. Nothing about delivery is reported back to the sender,
/// but a member's send still renews their lease.
pub(super) async fn publish_fragment(
    rooms: &RoomStore,
    hub: &RoomHub,
    room_id: RoomId,
    user_id: ParticipantId,
    message: String,
) {
    match rooms.modify(room_id, |room| room.touch(user_id, now())).await {
        Ok(_) => {
            let delivered = hub.publish(room_id, RelayEvent::Message { user_id, message });
            trace!(room = %room_id, participant = %user_id, delivered, "relayed fragment");
        }
        Err(err) => debug!(room = %room_id, participant = %user_id, %err, "dropping fragment"),
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn fetch_message(
    Path(room_id): Path<RoomId>,
    State(rooms): State<RoomStore>,
    Body(FetchMessageBody { uuid }): Body<FetchMessageBody>,
) -> AppResult<Json<Fetched>> {
    let uuid = required(uuid, "uuid")?;

    let peers = rooms
        .modify(room_id, |room| {
            room.touch(uuid, now())?;
            Ok(room
                .peer_messages(uuid)?
                .into_iter()
                .map(|(slot, message)| PeerMessage {
                    slot,
                    message: message.to_owned(),
                })
                .collect::<Vec<_>>())
        })
        .await?;

    Ok(Json(Fetched {
        message: peers.first().map(|peer| peer.message.clone()).unwrap_or_default(),
        peers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_last_three_lines() {
        let truncation = Truncation::default();
        assert_eq!(truncation.apply("a\nb\nc\nd"), "b\nc\nd");
        assert_eq!(truncation.apply("a\nb"), "a\nb");
        assert_eq!(truncation.apply("hello"), "hello");
        assert_eq!(truncation.apply(""), "");
    }

    #[test]
    fn last_line_only_follows_the_cursor() {
        let truncation = Truncation::LAST_LINE;
        assert_eq!(truncation.apply("first\nsecond"), "second");
        assert_eq!(truncation.apply("first\nsecond\n"), "");
        assert_eq!(truncation.apply("only"), "only");
    }

    #[test]
    fn long_lines_keep_their_tail() {
        let truncation = Truncation {
            lines: 1,
            max_chars: 3,
        };
        assert_eq!(truncation.apply("hello"), "llo");
        assert_eq!(truncation.apply("héllo wörld"), "rld");
        assert_eq!(truncation.apply("ab"), "ab");
    }
}
