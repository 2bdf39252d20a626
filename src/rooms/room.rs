use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = Uuid;
pub type ParticipantId = Uuid;

pub const MIN_CAPACITY: usize = 2;
pub const MAX_CAPACITY: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found")]
    NotFound,
    #[error("room is full")]
    RoomFull,
    #[error("room has no online members")]
    RoomGone,
    #[error("participant is not in this room")]
    NotAMember,
    #[error("only the room creator may change its visibility")]
    Forbidden,
    #[error("join code is already in use")]
    CodeTaken,
    #[error("room is busy, try again")]
    Contended,
    #[error("corrupt room row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Index into a room's slot list, in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotRef(pub usize);

impl SlotRef {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub participant: ParticipantId,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub join_code: Option<String>,
    pub creator: ParticipantId,
    pub is_private: bool,
    pub slots: Vec<Option<Slot>>,
    /// participant -> last seen, unix seconds
    pub online: BTreeMap<ParticipantId, i64>,
}

impl Room {
    /// A fresh private room with `creator` seated in the first slot and online.
    pub fn new(
        id: RoomId,
        creator: ParticipantId,
        capacity: usize,
        join_code: Option<String>,
        now: i64,
    ) -> Room {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        let mut slots = vec![None; capacity];
        slots[0] = Some(Slot {
            participant: creator,
            message: String::new(),
        });

        Room {
            id,
            join_code,
            creator,
            is_private: true,
            slots,
            online: BTreeMap::from([(creator, now)]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    pub fn is_online(&self, participant: ParticipantId) -> bool {
        self.online.contains_key(&participant)
    }

    pub fn slot_of(&self, participant: ParticipantId) -> Option<SlotRef> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.participant == participant))
            .map(SlotRef)
    }

    /// First empty slot in declared order.
    pub fn allocate_slot(&self) -> Result<SlotRef, RoomError> {
        self.slots
            .iter()
            .position(Option::is_none)
            .map(SlotRef)
            .ok_or(RoomError::RoomFull)
    }

    pub fn seat(&mut self, slot: SlotRef, participant: ParticipantId) -> Result<(), RoomError> {
        let Some(entry) = self.slots.get_mut(slot.index()) else {
            return Err(RoomError::RoomFull);
        };
        if entry.is_some() {
            return Err(RoomError::RoomFull);
        }

        *entry = Some(Slot {
            participant,
            message: String::new(),
        });
        Ok(())
    }

    /// Marks a seated participant online. A room nobody is in anymore is stale
    /// and must be thrown away by the caller.
    pub fn join(&mut self, participant: ParticipantId, now: i64) -> Result<(), RoomError> {
        if self.online.is_empty() {
            return Err(RoomError::RoomGone);
        }
        if self.slot_of(participant).is_none() {
            return Err(RoomError::NotAMember);
        }
        self.online.insert(participant, now);
        Ok(())
    }

    /// Allocates a slot for a brand new participant and marks them online.
    pub fn admit(&mut self, now: i64) -> Result<(ParticipantId, SlotRef), RoomError> {
        if self.online.is_empty() {
            return Err(RoomError::RoomGone);
        }
        let slot = self.allocate_slot()?;
        let participant = Uuid::new_v4();
        self.seat(slot, participant)?;
        self.join(participant, now)?;
        Ok((participant, slot))
    }

    /// Like `admit`, but only for rooms the random lookup may hand out.
    pub fn admit_public(&mut self, now: i64) -> Result<(ParticipantId, SlotRef), RoomError> {
        if self.is_private {
            return Err(RoomError::NotFound);
        }
        self.admit(now)
    }

    /// Takes the participant offline and frees their seat. Returns how many
    /// members are still online; zero means the room should go.
    pub fn leave(&mut self, participant: ParticipantId) -> Result<usize, RoomError> {
        if self.online.remove(&participant).is_none() {
            return Err(RoomError::NotAMember);
        }
        self.vacate(participant);
        Ok(self.online.len())
    }

    pub fn touch(&mut self, participant: ParticipantId, now: i64) -> Result<SlotRef, RoomError> {
        let Some(last_seen) = self.online.get_mut(&participant) else {
            return Err(RoomError::NotAMember);
        };
        *last_seen = now;
        self.slot_of(participant).ok_or(RoomError::NotAMember)
    }

    /// Drops members not seen within `lease_secs`, freeing their seats.
    pub fn evict_stale(&mut self, now: i64, lease_secs: i64) -> Vec<ParticipantId> {
        let deadline = now.saturating_sub(lease_secs);
        let stale: Vec<ParticipantId> = self
            .online
            .iter()
            .filter(|(_, last_seen)| **last_seen < deadline)
            .map(|(participant, _)| *participant)
            .collect();

        for participant in &stale {
            self.online.remove(participant);
            self.vacate(*participant);
        }
        stale
    }

    fn vacate(&mut self, participant: ParticipantId) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|slot| slot.participant == participant) {
                *slot = None;
            }
        }
    }

    /// Overwrites the participant's latest fragment. Only the newest survives.
    pub fn set_message(
        &mut self,
        participant: ParticipantId,
        message: String,
        now: i64,
    ) -> Result<SlotRef, RoomError> {
        let slot = self.touch(participant, now)?;
        if let Some(Some(seat)) = self.slots.get_mut(slot.index()) {
            seat.message = message;
        }
        Ok(slot)
    }

    /// Latest fragment of every other seated participant, in slot order.
    pub fn peer_messages(&self, participant: ParticipantId) -> Result<Vec<(SlotRef, &str)>, RoomError> {
        if !self.is_online(participant) {
            return Err(RoomError::NotAMember);
        }
        Ok(self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (SlotRef(index), slot)))
            .filter(|(_, slot)| slot.participant != participant)
            .map(|(slot_ref, slot)| (slot_ref, slot.message.as_str()))
            .collect())
    }

    /// Seated participants other than `participant`.
    pub fn roster(&self, participant: ParticipantId) -> Vec<(ParticipantId, SlotRef)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (slot.participant, SlotRef(index))))
            .filter(|(other, _)| *other != participant)
            .collect()
    }

    pub fn set_visibility(&mut self, requester: ParticipantId, is_private: bool) -> Result<bool, RoomError> {
        if requester != self.creator {
            return Err(RoomError::Forbidden);
        }
        self.is_private = is_private;
        Ok(self.is_private)
    }
}
