use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::{config::Settings, session::SessionManager};

/// Contains the application state, used by request handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    /// Postgres connection pool.
    pub pool: PgPool,

    pub settings: Arc<Settings>,

    /// In-memory session manager.
    pub sessions: Arc<Mutex<SessionManager>>,
}
