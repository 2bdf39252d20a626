pub mod config;
pub mod db;
pub mod res;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

use config::Config;
use rooms::{RoomError, RoomHub, RoomStore};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub rooms: RoomStore,
    pub hub: RoomHub,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: Config) -> AppState {
        AppState {
            rooms: RoomStore::new(db_pool, config.lease),
            hub: RoomHub::new(config.broadcast_capacity),
            config: Arc::new(config),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(app_state.config.session_minutes)));

    let cors = match app_state.config.cors_origin.as_deref().map(HeaderValue::from_str) {
        Some(Ok(origin)) => CorsLayer::new().allow_origin(origin),
        Some(Err(err)) => {
            tracing::warn!(%err, "ignoring malformed ONLYNOW_CORS_ORIGIN, allowing any origin");
            CorsLayer::new().allow_origin(Any)
        }
        None => CorsLayer::new().allow_origin(Any),
    }
    .allow_methods(Any)
    .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/r", rooms::router(app_state.config.relay))
        .with_state(app_state)
        .layer(session_layer)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    /// Missing or malformed input, rejected before touching the store.
    Invalid(String),
    Room(RoomError),
    Internal(anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::Room(err) => match err {
                RoomError::NotFound => StatusCode::NOT_FOUND,
                RoomError::NotAMember | RoomError::Forbidden => StatusCode::FORBIDDEN,
                RoomError::RoomFull | RoomError::CodeTaken => StatusCode::CONFLICT,
                RoomError::RoomGone => StatusCode::GONE,
                RoomError::Contended => StatusCode::SERVICE_UNAVAILABLE,
                RoomError::Corrupt(_) | RoomError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = ?self, "request failed");
            return (status, "internal server error").into_response();
        }

        let body = match self {
            AppError::Invalid(msg) => msg,
            AppError::Room(err) => err.to_string(),
            AppError::Internal(err) => err.to_string(),
        };
        (status, body).into_response()
    }
}

impl From<RoomError> for AppError {
    fn from(err: RoomError) -> Self {
        Self::Room(err)
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self::Internal(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(anyhow::Error);
apperr_impl!(tower_sessions::session::Error);

pub fn required<T>(value: Option<T>, field: &str) -> AppResult<T> {
    value.ok_or_else(|| AppError::Invalid(format!("{field} is required")))
}

pub fn required_str(value: Option<String>, field: &str) -> AppResult<String> {
    required(value, field).and_then(|value| {
        if value.trim().is_empty() {
            Err(AppError::Invalid(format!("{field} is required")))
        } else {
            Ok(value)
        }
    })
}

/// JSON request body, read whatever the content type says. Unload beacons
/// arrive as `text/plain`.
pub struct Body<T>(pub T);

impl<S, T> FromRequest<S> for Body<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|err| AppError::Invalid(err.body_text()))?;

        parse_body(&bytes).map(Body)
    }
}

pub fn parse_body<T: DeserializeOwned>(bytes: &[u8]) -> AppResult<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::Invalid("request body is required".to_owned()));
    }
    serde_json::from_slice(bytes).map_err(|err| AppError::Invalid(format!("malformed request body: {err}")))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Probe {
        room: Option<String>,
    }

    #[test]
    fn bodies_must_be_present_and_json() {
        assert!(matches!(parse_body::<Probe>(b""), Err(AppError::Invalid(_))));
        assert!(matches!(parse_body::<Probe>(b"  \n"), Err(AppError::Invalid(_))));
        assert!(matches!(parse_body::<Probe>(b"room=1"), Err(AppError::Invalid(_))));
        assert_eq!(parse_body::<Probe>(br#"{"room":"x"}"#).unwrap().room.as_deref(), Some("x"));
    }

    #[test]
    fn required_fields_are_validation_errors() {
        assert!(matches!(required::<u8>(None, "uuid"), Err(AppError::Invalid(msg)) if msg == "uuid is required"));
        assert!(matches!(required_str(Some("  ".to_owned()), "code"), Err(AppError::Invalid(_))));
        assert_eq!(required_str(Some("abc".to_owned()), "code").unwrap(), "abc");
    }

    #[test]
    fn store_failures_stay_opaque() {
        let err = AppError::from(RoomError::Store(sqlx::Error::PoolTimedOut));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = AppError::from(RoomError::Forbidden);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::from(RoomError::RoomFull).status(), StatusCode::CONFLICT);
        assert_eq!(AppError::from(RoomError::NotFound).status(), StatusCode::NOT_FOUND);
    }
}
