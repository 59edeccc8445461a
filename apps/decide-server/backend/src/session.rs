use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use types_rs::{auth::User, VoterId};
use uuid::Uuid;

use crate::state::AppState;

/// A logged in user's session, kept in memory.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    user_id: VoterId,
    username: String,
    is_staff: bool,

    /// The session token. This is meant to be opaque to the client.
    token: Uuid,

    /// The expiration time of the session.
    expiration: time::OffsetDateTime,
}

impl Session {
    fn new(user: &User, ttl: time::Duration) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            is_staff: user.is_staff,
            token: Uuid::new_v4(),
            expiration: time::OffsetDateTime::now_utc() + ttl,
        }
    }

    pub(crate) const fn user_id(&self) -> VoterId {
        self.user_id
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) const fn is_staff(&self) -> bool {
        self.is_staff
    }

    /// Returns whether the session has expired.
    pub(crate) fn is_expired(&self) -> bool {
        time::OffsetDateTime::now_utc() > self.expiration
    }

    /// Validates the session based on the token and expiration time.
    pub(crate) fn validate(&self, token: Uuid) -> bool {
        token == self.token && !self.is_expired()
    }

    /// Returns the session token.
    pub(crate) const fn token(&self) -> Uuid {
        self.token
    }
}

/// Manages a collection of user sessions stored in memory.
#[derive(Debug)]
pub(crate) struct SessionManager {
    sessions: Vec<Session>,
    ttl: time::Duration,
}

impl SessionManager {
    /// Creates a new session manager whose sessions last for `ttl`.
    pub(crate) const fn new(ttl: time::Duration) -> Self {
        Self {
            sessions: Vec::new(),
            ttl,
        }
    }

    /// Creates a new session for `user` and returns it.
    pub(crate) fn create(&mut self, user: &User) -> Session {
        let session = Session::new(user, self.ttl);
        self.sessions.push(session.clone());
        session
    }

    /// Validates a session token and returns the session if it is valid.
    pub(crate) fn validate(&mut self, token: Uuid) -> Option<Session> {
        self.sessions.retain(|s| !s.is_expired());
        self.sessions.iter().find(|s| s.validate(token)).cloned()
    }

    /// Ends the session with the given token. Returns whether it existed.
    pub(crate) fn remove(&mut self, token: Uuid) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.token != token);
        self.sessions.len() != before
    }
}

/// Extracts a session from the request's authorization header, allowing request
/// methods to require a session by including `Session` in their signature.
#[async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        AppState { sessions, .. }: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Extract the token from the authorization header
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| StatusCode::UNAUTHORIZED)?;
        let token = Uuid::parse_str(bearer.token()).map_err(|_| StatusCode::UNAUTHORIZED)?;

        // Expire old tokens
        let mut sessions = sessions.lock().await;

        // Look for a valid session with the given token
        if let Some(session) = sessions.validate(token) {
            tracing::debug!("Authorized session: {}", session.username());
            Ok(session)
        } else {
            tracing::warn!("Unauthorized session: {token}");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// A session whose user is staff. Rejects with 401 when there is no valid
/// session and 403 when the user is not staff.
#[derive(Debug, Clone)]
pub(crate) struct StaffSession(pub Session);

#[async_trait]
impl FromRequestParts<AppState> for StaffSession {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state).await?;

        if !session.is_staff() {
            tracing::warn!("Forbidden for non-staff user: {}", session.username());
            return Err(StatusCode::FORBIDDEN);
        }

        Ok(Self(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(is_staff: bool) -> User {
        User {
            id: 7,
            username: "voter1".to_owned(),
            email: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_staff,
            is_superuser: false,
            is_active: true,
        }
    }

    #[test]
    fn test_create_and_validate() {
        let mut manager = SessionManager::new(time::Duration::hours(1));
        let session = manager.create(&user(true));
        let found = manager.validate(session.token()).unwrap();
        assert_eq!(found.user_id(), 7);
        assert!(found.is_staff());
        assert!(manager.validate(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_expired_sessions_are_dropped() {
        let mut manager = SessionManager::new(time::Duration::seconds(-1));
        let session = manager.create(&user(false));
        assert!(manager.validate(session.token()).is_none());
        assert!(manager.sessions.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut manager = SessionManager::new(time::Duration::hours(1));
        let session = manager.create(&user(false));
        assert!(manager.remove(session.token()));
        assert!(!manager.remove(session.token()));
        assert!(manager.validate(session.token()).is_none());
    }
}
