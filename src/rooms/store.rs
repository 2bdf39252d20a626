use std::{collections::BTreeMap, time::Duration};

use sqlx::{types::Json, FromRow, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    now,
    room::{ParticipantId, Room, RoomError, RoomId, Slot},
};

const MAX_ATTEMPTS: usize = 16;

#[derive(FromRow)]
struct RoomRow {
    id: String,
    join_code: Option<String>,
    creator: String,
    is_private: bool,
    slots: Json<Vec<Option<Slot>>>,
    online_members: Json<BTreeMap<ParticipantId, i64>>,
    version: i64,
}

impl RoomRow {
    fn into_room(self) -> Result<(Room, i64), RoomError> {
        let parse = |field: &str, value: &str| {
            Uuid::parse_str(value).map_err(|err| RoomError::Corrupt(format!("{field} {value:?}: {err}")))
        };

        let room = Room {
            id: parse("id", &self.id)?,
            join_code: self.join_code,
            creator: parse("creator", &self.creator)?,
            is_private: self.is_private,
            slots: self.slots.0,
            online: self.online_members.0,
        };
        Ok((room, self.version))
    }
}

/// What a sweep changed, so the relay can tell connected peers.
#[derive(Debug, Default)]
pub struct Sweep {
    pub evicted: Vec<(RoomId, ParticipantId)>,
    pub deleted: Vec<RoomId>,
}

/// Row-per-room table. Every mutation is a conditional write against the
/// version it read, retried on conflict.
#[derive(Clone)]
pub struct RoomStore {
    db_pool: SqlitePool,
    lease_secs: Option<i64>,
}

impl RoomStore {
    pub fn new(db_pool: SqlitePool, lease: Option<Duration>) -> RoomStore {
        RoomStore {
            db_pool,
            lease_secs: lease.map(|lease| i64::try_from(lease.as_secs()).unwrap_or(i64::MAX)),
        }
    }

    pub async fn create(&self, capacity: usize, join_code: Option<String>) -> Result<Room, RoomError> {
        let room = Room::new(Uuid::now_v7(), Uuid::new_v4(), capacity, join_code, now());

        let result = sqlx::query("INSERT INTO rooms (id,join_code,creator,is_private,slots,online_members) VALUES (?,?,?,?,?,?)")
            .bind(room.id.to_string())
            .bind(&room.join_code)
            .bind(room.creator.to_string())
            .bind(room.is_private)
            .bind(Json(&room.slots))
            .bind(Json(&room.online))
            .execute(&self.db_pool)
            .await;

        match result {
            Ok(_) => {
                info!(room = %room.id, capacity = room.capacity(), "created room");
                Ok(room)
            }
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Err(RoomError::CodeTaken),
            Err(err) => Err(err.into()),
        }
    }

    async fn fetch(&self, id: RoomId) -> Result<(Room, i64), RoomError> {
        let Some(row) = sqlx::query_as::<_, RoomRow>(
            "SELECT id,join_code,creator,is_private,slots,online_members,version FROM rooms WHERE id=?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db_pool)
        .await?
        else {
            return Err(RoomError::NotFound);
        };

        row.into_room()
    }

    pub async fn find_by_id(&self, id: RoomId) -> Result<Room, RoomError> {
        self.fetch(id).await.map(|(room, _)| room)
    }

    pub async fn find_by_join_code(&self, code: &str) -> Result<Room, RoomError> {
        let Some(row) = sqlx::query_as::<_, RoomRow>(
            "SELECT id,join_code,creator,is_private,slots,online_members,version FROM rooms WHERE join_code=?",
        )
        .bind(code)
        .fetch_optional(&self.db_pool)
        .await?
        else {
            return Err(RoomError::NotFound);
        };

        row.into_room().map(|(room, _)| room)
    }

    /// Lowest-id public room.
    pub async fn find_random_public_room(&self) -> Result<Room, RoomError> {
        self.find_public_room_after(None).await
    }

    /// Lowest-id public room strictly after `after`, for walking candidates.
    pub async fn find_public_room_after(&self, after: Option<RoomId>) -> Result<Room, RoomError> {
        let after = after.map(|id| id.to_string()).unwrap_or_default();

        let Some(row) = sqlx::query_as::<_, RoomRow>(
            "SELECT id,join_code,creator,is_private,slots,online_members,version FROM rooms WHERE is_private=FALSE AND id>? ORDER BY id LIMIT 1",
        )
        .bind(after)
        .fetch_optional(&self.db_pool)
        .await?
        else {
            return Err(RoomError::NotFound);
        };

        row.into_room().map(|(room, _)| room)
    }

    /// Reads the room, applies `change` and writes it back only if nobody else
    /// wrote in between. A room found empty is deleted and reported gone; a
    /// room left empty by `change` is deleted and the change succeeds.
    pub async fn modify<T, F>(&self, id: RoomId, mut change: F) -> Result<T, RoomError>
    where
        T: Send,
        F: FnMut(&mut Room) -> Result<T, RoomError> + Send,
    {
        for _ in 0..MAX_ATTEMPTS {
            let (mut room, version) = self.fetch(id).await?;
            if let Some(lease_secs) = self.lease_secs {
                room.evict_stale(now(), lease_secs);
            }

            if room.is_empty() {
                if self.remove(id, version).await? {
                    info!(room = %id, "deleted abandoned room");
                    return Err(RoomError::RoomGone);
                }
                continue;
            }

            let outcome = change(&mut room)?;

            if room.is_empty() {
                if self.remove(id, version).await? {
                    info!(room = %id, "last member left, deleted room");
                    return Ok(outcome);
                }
            } else if self.write(&room, version).await? {
                return Ok(outcome);
            }

            debug!(room = %id, "conflicting write, retrying");
        }

        warn!(room = %id, attempts = MAX_ATTEMPTS, "giving up on contended room");
        Err(RoomError::Contended)
    }

    async fn write(&self, room: &Room, version: i64) -> Result<bool, RoomError> {
        let result = sqlx::query("UPDATE rooms SET is_private=?,slots=?,online_members=?,version=version+1 WHERE id=? AND version=?")
            .bind(room.is_private)
            .bind(Json(&room.slots))
            .bind(Json(&room.online))
            .bind(room.id.to_string())
            .bind(version)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn remove(&self, id: RoomId, version: i64) -> Result<bool, RoomError> {
        let result = sqlx::query("DELETE FROM rooms WHERE id=? AND version=?")
            .bind(id.to_string())
            .bind(version)
            .execute(&self.db_pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Evicts stale members everywhere, deleting rooms that end up empty.
    /// Rooms written concurrently are left for the next sweep.
    pub async fn sweep(&self) -> Result<Sweep, RoomError> {
        let mut sweep = Sweep::default();
        let Some(lease_secs) = self.lease_secs else {
            return Ok(sweep);
        };

        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM rooms")
            .fetch_all(&self.db_pool)
            .await?;

        for (id,) in ids {
            let Ok(id) = Uuid::parse_str(&id) else {
                warn!(room = %id, "skipping room with malformed id");
                continue;
            };

            let (mut room, version) = match self.fetch(id).await {
                Ok(found) => found,
                Err(RoomError::NotFound) => continue,
                Err(err) => return Err(err),
            };

            let evicted = room.evict_stale(now(), lease_secs);
            if evicted.is_empty() {
                continue;
            }

            let written = if room.is_empty() {
                let removed = self.remove(id, version).await?;
                if removed {
                    sweep.deleted.push(id);
                }
                removed
            } else {
                self.write(&room, version).await?
            };

            if written {
                debug!(room = %id, evicted = evicted.len(), "evicted stale members");
                sweep.evicted.extend(evicted.into_iter().map(|participant| (id, participant)));
            }
        }

        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, rooms::room::SlotRef};

    async fn store(lease: Option<Duration>) -> RoomStore {
        RoomStore::new(db::connect("sqlite::memory:").await.unwrap(), lease)
    }

    #[tokio::test]
    async fn created_room_round_trips() {
        let rooms = store(None).await;
        let room = rooms.create(3, Some("cats".to_owned())).await.unwrap();

        let found = rooms.find_by_id(room.id).await.unwrap();
        assert_eq!(found, room);
        assert!(found.is_private);
        assert_eq!(found.online_count(), 1);

        let by_code = rooms.find_by_join_code("cats").await.unwrap();
        assert_eq!(by_code.id, room.id);
        assert!(matches!(rooms.find_by_join_code("dogs").await, Err(RoomError::NotFound)));
        assert!(matches!(rooms.find_by_id(Uuid::now_v7()).await, Err(RoomError::NotFound)));
    }

    #[tokio::test]
    async fn join_codes_are_unique() {
        let rooms = store(None).await;
        rooms.create(2, Some("abc".to_owned())).await.unwrap();
        assert!(matches!(rooms.create(2, Some("abc".to_owned())).await, Err(RoomError::CodeTaken)));
        rooms.create(2, None).await.unwrap();
        rooms.create(2, None).await.unwrap();
    }

    #[tokio::test]
    async fn random_lookup_only_sees_public_rooms() {
        let rooms = store(None).await;
        assert!(matches!(rooms.find_random_public_room().await, Err(RoomError::NotFound)));

        let hidden = rooms.create(2, None).await.unwrap();
        let first = rooms.create(2, None).await.unwrap();
        let second = rooms.create(2, None).await.unwrap();
        assert!(matches!(rooms.find_random_public_room().await, Err(RoomError::NotFound)));

        for room in [&first, &second] {
            let creator = room.creator;
            rooms.modify(room.id, |room| room.set_visibility(creator, false)).await.unwrap();
        }

        let found = rooms.find_random_public_room().await.unwrap();
        assert!(!found.is_private);
        assert_ne!(found.id, hidden.id);
        assert_eq!(found.id, first.id.min(second.id));

        let next = rooms.find_public_room_after(Some(found.id)).await.unwrap();
        assert_eq!(next.id, first.id.max(second.id));
        assert!(matches!(rooms.find_public_room_after(Some(next.id)).await, Err(RoomError::NotFound)));
    }

    #[tokio::test]
    async fn concurrent_admits_never_share_a_slot() {
        let rooms = store(None).await;
        let room_id = rooms.create(5, None).await.unwrap().id;

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let rooms = rooms.clone();
                tokio::spawn(async move { rooms.modify(room_id, |room| room.admit(now())).await })
            })
            .collect();

        let mut slots = Vec::new();
        let mut full = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok((_, slot)) => slots.push(slot),
                Err(RoomError::RoomFull) => full += 1,
                Err(err) => panic!("unexpected {err}"),
            }
        }

        slots.sort();
        assert_eq!(slots, vec![SlotRef(1), SlotRef(2), SlotRef(3), SlotRef(4)]);
        assert_eq!(full, 6);
        assert_eq!(rooms.find_by_id(room_id).await.unwrap().online_count(), 5);
    }

    #[tokio::test]
    async fn last_leave_deletes_the_room() {
        let rooms = store(None).await;
        let room = rooms.create(2, None).await.unwrap();
        let (guest, _) = rooms.modify(room.id, |room| room.admit(now())).await.unwrap();

        assert_eq!(rooms.modify(room.id, |room| room.leave(guest)).await.unwrap(), 1);
        assert_eq!(rooms.modify(room.id, |room| room.leave(room.creator)).await.unwrap(), 0);
        assert!(matches!(rooms.find_by_id(room.id).await, Err(RoomError::NotFound)));
        assert!(matches!(
            rooms.modify(room.id, |room| room.leave(guest)).await,
            Err(RoomError::NotFound)
        ));
    }

    #[tokio::test]
    async fn abandoned_room_is_gone_on_next_join() {
        let db_pool = db::connect("sqlite::memory:").await.unwrap();
        let rooms = RoomStore::new(db_pool.clone(), None);
        let leased = RoomStore::new(db_pool, Some(Duration::from_secs(30)));

        let room = rooms.create(2, None).await.unwrap();
        rooms
            .modify(room.id, |room| {
                room.online.values_mut().for_each(|last_seen| *last_seen = 0);
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            leased.modify(room.id, |room| room.admit(now())).await,
            Err(RoomError::RoomGone)
        ));
        assert!(matches!(rooms.find_by_id(room.id).await, Err(RoomError::NotFound)));
    }

    #[tokio::test]
    async fn sweep_evicts_ghosts_and_reaps_empty_rooms() {
        let db_pool = db::connect("sqlite::memory:").await.unwrap();
        let rooms = RoomStore::new(db_pool.clone(), None);
        let leased = RoomStore::new(db_pool, Some(Duration::from_secs(30)));

        let lively = rooms.create(2, None).await.unwrap();
        let (ghost, _) = rooms.modify(lively.id, |room| room.admit(now())).await.unwrap();
        rooms
            .modify(lively.id, |room| {
                room.online.insert(ghost, 0);
                Ok(())
            })
            .await
            .unwrap();

        let abandoned = rooms.create(2, None).await.unwrap();
        rooms
            .modify(abandoned.id, |room| {
                room.online.values_mut().for_each(|last_seen| *last_seen = 0);
                Ok(())
            })
            .await
            .unwrap();

        let sweep = leased.sweep().await.unwrap();
        assert_eq!(sweep.deleted, vec![abandoned.id]);
        assert!(sweep.evicted.contains(&(lively.id, ghost)));
        assert!(sweep.evicted.contains(&(abandoned.id, abandoned.creator)));

        let lively = rooms.find_by_id(lively.id).await.unwrap();
        assert!(!lively.is_online(ghost));
        assert_eq!(lively.slot_of(ghost), None);
        assert!(matches!(rooms.find_by_id(abandoned.id).await, Err(RoomError::NotFound)));

        assert!(rooms.sweep().await.unwrap().evicted.is_empty());
    }
}
