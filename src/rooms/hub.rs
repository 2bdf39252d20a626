use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::room::{ParticipantId, RoomId};

/// Server -> client relay events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RelayEvent {
    Message {
        user_id: ParticipantId,
        message: String,
    },
    NewUser {
        user_id: ParticipantId,
        user_index: usize,
    },
    UserLeft {
        user_id: ParticipantId,
    },
}

impl RelayEvent {
    pub fn user_id(&self) -> ParticipantId {
        match self {
            RelayEvent::Message { user_id, .. }
            | RelayEvent::NewUser { user_id, .. }
            | RelayEvent::UserLeft { user_id } => *user_id,
        }
    }

    /// Anything that isn't exactly one of the known events is `None`.
    #[cfg(test)]
    pub fn decode(raw: &[u8]) -> Option<RelayEvent> {
        serde_json::from_slice(raw).ok()
    }
}

/// Client -> server frames on a room socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Message { message: String },
}

impl ClientFrame {
    pub fn decode(raw: &[u8]) -> Option<ClientFrame> {
        serde_json::from_slice(raw).ok()
    }
}

/// One broadcast channel per room with at least one subscriber.
#[derive(Clone)]
pub struct RoomHub {
    channels: Arc<Mutex<HashMap<RoomId, broadcast::Sender<RelayEvent>>>>,
    capacity: usize,
}

impl RoomHub {
    pub fn new(capacity: usize) -> RoomHub {
        RoomHub {
            channels: Arc::default(),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<RoomId, broadcast::Sender<RelayEvent>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, room_id: RoomId) -> broadcast::Receiver<RelayEvent> {
        self.channels()
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Best effort: returns how many subscribers were handed the event.
    pub fn publish(&self, room_id: RoomId, event: RelayEvent) -> usize {
        let mut channels = self.channels();
        let Some(tx) = channels.get(&room_id) else {
            return 0;
        };

        match tx.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                channels.remove(&room_id);
                0
            }
        }
    }

    pub fn close(&self, room_id: RoomId) {
        self.channels().remove(&room_id);
    }

    /// Forgets channels nobody listens to anymore.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    #[cfg(test)]
    pub fn subscribers(&self, room_id: RoomId) -> usize {
        self.channels()
            .get(&room_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber() {
        let hub = RoomHub::new(8);
        let room_id = Uuid::now_v7();
        let mut a = hub.subscribe(room_id);
        let mut b = hub.subscribe(room_id);

        let event = RelayEvent::Message {
            user_id: Uuid::new_v4(),
            message: "hello".to_owned(),
        };
        assert_eq!(hub.publish(room_id, event.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn publishing_to_nobody_is_dropped() {
        let hub = RoomHub::new(8);
        let room_id = Uuid::now_v7();
        let event = RelayEvent::UserLeft { user_id: Uuid::new_v4() };
        assert_eq!(hub.publish(room_id, event.clone()), 0);

        drop(hub.subscribe(room_id));
        assert_eq!(hub.publish(room_id, event), 0);
        assert_eq!(hub.subscribers(room_id), 0);
    }

    #[test]
    fn rooms_are_isolated() {
        let hub = RoomHub::new(8);
        let (here, there) = (Uuid::now_v7(), Uuid::now_v7());
        let mut rx = hub.subscribe(here);
        let _other = hub.subscribe(there);

        hub.publish(there, RelayEvent::UserLeft { user_id: Uuid::new_v4() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn prune_drops_idle_channels() {
        let hub = RoomHub::new(8);
        let kept = hub.subscribe(Uuid::now_v7());
        drop(hub.subscribe(Uuid::now_v7()));
        assert_eq!(hub.prune(), 1);
        drop(kept);
        assert_eq!(hub.prune(), 1);
    }

    #[test]
    fn events_use_tagged_wire_shape() {
        let user_id = Uuid::new_v4();
        let event = RelayEvent::NewUser { user_id, user_index: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "new_user", "payload": {"user_id": user_id, "user_index": 2}})
        );
        assert_eq!(RelayEvent::decode(json.to_string().as_bytes()), Some(event));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        assert_eq!(RelayEvent::decode(br#"{"event":"message","payload":{"user_id":"nope"}}"#), None);
        assert_eq!(RelayEvent::decode(br#"{"event":"explode"}"#), None);
        assert_eq!(RelayEvent::decode(b"hello"), None);

        assert_eq!(
            ClientFrame::decode(br#"{"event":"message","payload":{"message":"hi"}}"#),
            Some(ClientFrame::Message { message: "hi".to_owned() })
        );
        assert_eq!(ClientFrame::decode(br#"{"event":"message","payload":{}}"#), None);
        assert_eq!(ClientFrame::decode(br#"{"message":"hi"}"#), None);
    }
}
