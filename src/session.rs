use std::collections::HashMap;

use axum::{extract::FromRequestParts, http::request::Parts};
use tower_sessions::Session;

use crate::{rooms::{ParticipantId, RoomId}, AppResult};

pub const SEATS: &str = "seats";

/// Which participant this browser is in each room it joined.
pub struct Seats(Session);

impl<S> FromRequestParts<S> for Seats
where
    S: Send + Sync,
{
    type Rejection = <Session as FromRequestParts<S>>::Rejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Session::from_request_parts(parts, state).await.map(Seats)
    }
}

impl Seats {
    async fn all(&self) -> AppResult<HashMap<RoomId, ParticipantId>> {
        Ok(self.0.get(SEATS).await?.unwrap_or_default())
    }

    pub async fn get(&self, room_id: RoomId) -> AppResult<Option<ParticipantId>> {
        Ok(self.all().await?.get(&room_id).copied())
    }

    pub async fn remember(&self, room_id: RoomId, participant: ParticipantId) -> AppResult<()> {
        let mut seats = self.all().await?;
        seats.insert(room_id, participant);
        self.0.insert(SEATS, seats).await?;
        Ok(())
    }

    pub async fn forget(&self, room_id: RoomId) -> AppResult<()> {
        let mut seats = self.all().await?;
        if seats.remove(&room_id).is_some() {
            self.0.insert(SEATS, seats).await?;
        }
        Ok(())
    }
}
