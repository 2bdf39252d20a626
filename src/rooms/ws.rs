use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::{config::Config, required, AppResult, AppState};

use super::{now, ClientFrame, ParticipantId, RelayEvent, RoomHub, RoomId, RoomStore, SlotRef};

const IDLE_REFRESH: Duration = Duration::from_secs(3600);

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    uuid: Option<ParticipantId>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<RoomId>,
    Query(WsQuery { uuid }): Query<WsQuery>,
    State(rooms): State<RoomStore>,
    State(hub): State<RoomHub>,
    State(config): State<Arc<Config>>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let participant = required(uuid, "uuid")?;

    let roster = rooms
        .modify(room_id, |room| {
            room.touch(participant, now())?;
            Ok(room.roster(participant))
        })
        .await?;
    let rx = hub.subscribe(room_id);

    Ok(ws.on_upgrade(move |stream| {
        relay_socket(stream, room_id, participant, roster, rx, rooms, hub, config)
    }))
}

#[allow(clippy::too_many_arguments)]
async fn relay_socket(
    stream: WebSocket,
    room_id: RoomId,
    participant: ParticipantId,
    roster: Vec<(ParticipantId, SlotRef)>,
    mut rx: broadcast::Receiver<RelayEvent>,
    rooms: RoomStore,
    hub: RoomHub,
    config: Arc<Config>,
) {
    let (mut sender, mut receiver) = stream.split();
    info!(room = %room_id, participant = %participant, "socket opened");

    for (user_id, slot) in roster {
        let event = RelayEvent::NewUser {
            user_id,
            user_index: slot.index(),
        };
        let Ok(text) = serde_json::to_string(&event) else {
            continue;
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    let mut broadcast_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(room = %room_id, participant = %participant, skipped, "socket lagging, skipped events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            // disconnected or evicted, the socket no longer speaks for a member
            if event == (RelayEvent::UserLeft { user_id: participant }) {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // nobody needs their own fragments echoed back
            if event.user_id() == participant {
                continue;
            }

            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // an open socket is proof of life, renew well before the lease runs out
    let refresh = config.lease.map_or(IDLE_REFRESH, |lease| (lease / 3).max(Duration::from_secs(1)));
    let mut lease = tokio::time::interval(refresh);
    lease.tick().await;

    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else {
                    break;
                };
                if let Message::Close(_) = frame {
                    break;
                }
                if !matches!(frame, Message::Text(_) | Message::Binary(_)) {
                    continue;
                }

                let Some(ClientFrame::Message { message }) = ClientFrame::decode(&frame.into_data()) else {
                    debug!(room = %room_id, participant = %participant, "dropping malformed frame");
                    continue;
                };
                let message = config.truncation.apply(&message);
                hub.publish(room_id, RelayEvent::Message { user_id: participant, message });
            }
            _ = lease.tick() => {
                if let Err(err) = rooms.modify(room_id, |room| room.touch(participant, now())).await {
                    debug!(room = %room_id, participant = %participant, %err, "lease refresh failed, closing socket");
                    break;
                }
            }
            _ = &mut broadcast_task => break,
        }
    }

    broadcast_task.abort();
    info!(room = %room_id, participant = %participant, "socket closed");
}
