//! Application definition, including all HTTP route handlers.
//!
//! Route handlers are bundled via [`setup`] into an [`axum::Router`], which can then be run
//! using [`run`] at the configured port (see [`config`][`super::config`]).

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::Level;
use types_rs::{
    auth::{LoginRequest, LoginResponse, NewUser, User},
    booth::{BoothContext, BoothNotFound},
    census::{parse_census_csv, CensusCreate, CensusVoters, CsvImportSummary, CsvUpload},
    postproc::tally_summary,
    store::{StoreFilter, StoreVote, Vote},
    visualizer::VisualizerView,
    voting::{NewAuth, NewVoting, Question, Voting, VotingAction, VotingActionRequest},
    QuestionId, VoterId, VotingId,
};

use crate::{
    config::{Config, Settings, MAX_REQUEST_SIZE},
    db, password,
    session::{Session, SessionManager, StaffSession},
    state::AppState,
    tally,
};

/// Prepares the application to be run within an HTTP server.
///
/// Requires a [`PgPool`] from [`db::setup`]. Run the application with [`run`]
/// with the result of this function.
pub async fn setup(pool: PgPool, settings: Settings) -> Router {
    let _entered = tracing::span!(Level::DEBUG, "Setting up application").entered();
    let sessions = SessionManager::new(settings.session_ttl);
    Router::new()
        .route("/api/status", get(get_status))
        .route("/authentication/login/", post(login))
        .route("/authentication/logout/", post(logout))
        .route("/authentication/getuser/", post(get_user))
        .route("/authentication/register/", post(register))
        .route("/census/", get(list_census).post(create_census))
        .route("/census/upload", post(upload_census))
        .route("/census/uploads", get(list_census_uploads))
        .route("/census/uploads/:upload_id", delete(delete_census_upload))
        .route(
            "/census/:voting_id/",
            get(check_census).delete(delete_census),
        )
        .route("/voting/", get(list_votings).post(create_voting))
        .route("/voting/questions/", get(list_questions))
        .route("/voting/questions/:question_id/", delete(delete_question))
        .route(
            "/voting/:voting_id/",
            put(update_voting).delete(delete_voting),
        )
        .route("/store/", get(list_votes).post(store_vote))
        .route("/booth/:voting_id/:question_id/", get(get_booth))
        .route("/visualizer/:voting_id/", get(get_visualizer))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            pool,
            settings: Arc::new(settings),
            sessions: Arc::new(Mutex::new(sessions)),
        })
}

/// Create and run an HTTP server using the provided application at the port
/// from [`config`][`super::config`].
pub async fn run(app: Router, config: &Config) -> color_eyre::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    tracing::info!("Server listening at http://{addr}/");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Always responds with a successful status. Used to check whether the server
/// is running.
async fn get_status() -> impl IntoResponse {
    StatusCode::OK
}

/// Unwraps a JSON body, turning any rejection into a 400.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Error> {
    body.map(|Json(body)| body)
        .map_err(|rejection| Error::BadRequest(rejection.body_text()))
}

async fn login(
    State(AppState { pool, sessions, .. }): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, Error> {
    let LoginRequest { username, password } = json_body(body)?;
    let mut conn = pool.acquire().await?;

    let user = match db::get_user_for_login(&mut conn, &username).await? {
        Some((user, hash)) if password::verify_password(&password, &hash) => user,
        _ => {
            tracing::warn!("Failed login for {username:?}");
            return Err(Error::BadRequest(
                "Unable to log in with provided credentials.".to_owned(),
            ));
        }
    };

    let session = sessions.lock().await.create(&user);
    tracing::info!("Logged in: {}", user.username);

    Ok(Json(LoginResponse {
        token: session.token().to_string(),
    }))
}

async fn logout(
    session: Session,
    State(AppState { sessions, .. }): State<AppState>,
) -> impl IntoResponse {
    sessions.lock().await.remove(session.token());
    tracing::info!("Logged out: {}", session.username());
    StatusCode::OK
}

async fn get_user(
    session: Session,
    State(AppState { pool, .. }): State<AppState>,
) -> Result<Json<User>, Error> {
    let mut conn = pool.acquire().await?;
    db::get_user(&mut conn, session.user_id())
        .await?
        .map(Json)
        .ok_or_else(|| Error::Unauthorized("Invalid token.".to_owned()))
}

async fn register(
    StaffSession(session): StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let new_user = json_body(body)?;
    if new_user.username.trim().is_empty() || new_user.password.is_empty() {
        return Err(Error::BadRequest(
            "username and password are required".to_owned(),
        ));
    }

    let hash = password::hash_password(&new_user.password).map_err(|e| Error::Other(e.into()))?;
    let mut conn = pool.acquire().await?;

    match db::create_user(&mut conn, &new_user, &hash).await {
        Ok(user) => {
            tracing::info!("{} registered user {}", session.username(), user.username);
            Ok((StatusCode::CREATED, Json(user)))
        }
        Err(e) if db::is_integrity_error(&e) => Err(Error::Conflict(format!(
            "A user with username {:?} already exists",
            new_user.username
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn create_census(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    body: Result<Json<CensusCreate>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let CensusCreate { voting_id, voters } = json_body(body)?;
    let mut conn = pool.acquire().await?;

    match db::create_census(&mut conn, voting_id, &voters).await {
        Ok(()) => Ok((StatusCode::CREATED, Json("Census created"))),
        Err(e) if db::is_integrity_error(&e) => {
            Err(Error::Conflict("Error try to create census".to_owned()))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct ListCensusQuery {
    voting_id: VotingId,
}

async fn list_census(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Query(ListCensusQuery { voting_id }): Query<ListCensusQuery>,
) -> Result<Json<CensusVoters>, Error> {
    let mut conn = pool.acquire().await?;
    let voters = db::list_census(&mut conn, voting_id).await?;
    Ok(Json(CensusVoters { voters }))
}

async fn delete_census(
    State(AppState { pool, .. }): State<AppState>,
    Path(voting_id): Path<VotingId>,
    body: Result<Json<CensusVoters>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let CensusVoters { voters } = json_body(body)?;
    let mut conn = pool.acquire().await?;
    let deleted = db::delete_census(&mut conn, voting_id, &voters).await?;
    tracing::info!("Deleted {deleted} voters from the census of voting {voting_id}");
    Ok((StatusCode::NO_CONTENT, Json("Voters deleted from census")))
}

#[derive(Debug, Deserialize)]
struct CheckCensusQuery {
    voter_id: VoterId,
}

async fn check_census(
    State(AppState { pool, .. }): State<AppState>,
    Path(voting_id): Path<VotingId>,
    Query(CheckCensusQuery { voter_id }): Query<CheckCensusQuery>,
) -> Result<impl IntoResponse, Error> {
    let mut conn = pool.acquire().await?;

    if db::census_contains(&mut conn, voting_id, voter_id).await? {
        Ok(Json("Valid voter"))
    } else {
        Err(Error::Unauthorized("Invalid voter".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct UploadCensusQuery {
    file_name: Option<String>,
}

async fn upload_census(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Query(UploadCensusQuery { file_name }): Query<UploadCensusQuery>,
    contents: String,
) -> Result<impl IntoResponse, Error> {
    let file_name = file_name.unwrap_or_else(|| "census.csv".to_owned());
    let mut conn = pool.acquire().await?;

    let upload = db::create_census_upload(&mut conn, &file_name, &contents).await?;
    let rows = parse_census_csv(&contents).map_err(|e| {
        tracing::error!("Rejected census file {file_name:?}: {e}");
        Error::BadRequest(e.to_string())
    })?;

    let summary: CsvImportSummary = db::import_census_upload(&mut conn, upload.id, &rows).await?;
    tracing::info!(
        "Imported census file {file_name:?}: {} new, {} skipped",
        summary.imported,
        summary.skipped
    );
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_census_uploads(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
) -> Result<Json<Vec<CsvUpload>>, Error> {
    let mut conn = pool.acquire().await?;
    Ok(Json(db::list_census_uploads(&mut conn).await?))
}

async fn delete_census_upload(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Path(upload_id): Path<i32>,
) -> Result<impl IntoResponse, Error> {
    let mut conn = pool.acquire().await?;

    if db::delete_census_upload(&mut conn, upload_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("Census upload not found".to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct ListVotingsQuery {
    id: Option<VotingId>,
}

async fn list_votings(
    State(AppState { pool, .. }): State<AppState>,
    Query(ListVotingsQuery { id }): Query<ListVotingsQuery>,
) -> Result<Json<Vec<Voting>>, Error> {
    let mut conn = pool.acquire().await?;
    Ok(Json(db::list_votings(&mut conn, id).await?))
}

async fn create_voting(
    _session: StaffSession,
    State(AppState { pool, settings, .. }): State<AppState>,
    body: Result<Json<NewVoting>, JsonRejection>,
) -> Result<impl IntoResponse, Error> {
    let new_voting = json_body(body)?;
    new_voting
        .validate()
        .map_err(|e| Error::BadRequest(e.to_string()))?;

    let default_auth = NewAuth {
        name: "local".to_owned(),
        url: settings.base_url.clone(),
    };
    let mut conn = pool.acquire().await?;

    let voting_id =
        match db::create_voting(&mut conn, &new_voting, &default_auth, &settings.base_url).await {
            Ok(voting_id) => voting_id,
            Err(e) if db::is_integrity_error(&e) => {
                return Err(Error::Conflict(
                    "A voting with this name or a question with this description already exists"
                        .to_owned(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

    tracing::info!("Created voting {voting_id}: {}", new_voting.name);
    let voting = db::get_voting(&mut conn, voting_id)
        .await?
        .ok_or_else(|| Error::NotFound("Voting not found".to_owned()))?;
    Ok((StatusCode::CREATED, Json(voting)))
}

async fn update_voting(
    _session: StaffSession,
    State(AppState { pool, settings, .. }): State<AppState>,
    Path(voting_id): Path<VotingId>,
    body: Result<Json<VotingActionRequest>, JsonRejection>,
) -> Result<Json<String>, Error> {
    let VotingActionRequest { action } = json_body(body)?;
    let mut conn = pool.acquire().await?;

    let voting = db::get_voting(&mut conn, voting_id)
        .await?
        .ok_or_else(|| Error::NotFound("Voting not found".to_owned()))?;
    let action: VotingAction = action
        .parse()
        .map_err(|e: types_rs::voting::UnknownAction| Error::BadRequest(e.to_string()))?;
    let status = voting.status();
    status
        .check(action)
        .map_err(|e| Error::BadRequest(e.to_string()))?;

    let now = time::OffsetDateTime::now_utc();
    let message = match action {
        VotingAction::Start => {
            let keybits = settings.keybits;
            let auth_ids: Vec<i32> = voting.auths.iter().map(|auth| auth.id).collect();
            let keys = tokio::task::spawn_blocking(move || tally::create_keys(keybits, &auth_ids))
                .await
                .map_err(|e| Error::Other(e.into()))?
                .map_err(|e| Error::Other(e.into()))?;

            if !db::start_voting(&mut conn, voting_id, &keys.key_pairs, &keys.pub_key, now).await? {
                return Err(Error::BadRequest(
                    types_rs::voting::StatusError::AlreadyStarted.to_string(),
                ));
            }
            action.success_message().to_owned()
        }
        VotingAction::Stop => {
            if !db::stop_voting(&mut conn, voting_id, now).await? {
                return Err(Error::BadRequest(
                    types_rs::voting::StatusError::AlreadyStopped.to_string(),
                ));
            }
            action.success_message().to_owned()
        }
        VotingAction::Tally => {
            let key_pairs = db::get_key_pairs(&mut conn, voting_id).await?;
            let votes = db::list_votes(
                &mut conn,
                &StoreFilter {
                    voting_id: Some(voting_id),
                    voter_id: None,
                },
            )
            .await?;

            let outcome = {
                let voting = voting.clone();
                tokio::task::spawn_blocking(move || tally::tally_votes(&voting, key_pairs, &votes))
                    .await
                    .map_err(|e| Error::Other(e.into()))?
                    .map_err(|e| Error::Other(e.into()))?
            };

            if !db::save_tally(
                &mut conn,
                voting_id,
                &outcome.tally,
                &outcome.postproc,
                outcome.total_votes,
            )
            .await?
            {
                return Err(Error::BadRequest(
                    types_rs::voting::StatusError::AlreadyTallied.to_string(),
                ));
            }

            tracing::info!(
                "Tallied voting {voting_id}: {}",
                tally_summary(&outcome.postproc)
            );
            action.success_message().to_owned()
        }
    };

    tracing::info!("Voting {voting_id} ({}): {message}", voting.name);
    Ok(Json(message))
}

async fn delete_voting(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Path(voting_id): Path<VotingId>,
) -> Result<impl IntoResponse, Error> {
    let mut conn = pool.acquire().await?;

    if db::delete_voting(&mut conn, voting_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("Voting not found".to_owned()))
    }
}

async fn list_questions(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
) -> Result<Json<Vec<Question>>, Error> {
    let mut conn = pool.acquire().await?;
    Ok(Json(db::list_questions(&mut conn).await?))
}

async fn delete_question(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Path(question_id): Path<QuestionId>,
) -> Result<impl IntoResponse, Error> {
    let mut conn = pool.acquire().await?;

    if db::question_in_started_voting(&mut conn, question_id).await? {
        return Err(Error::Conflict(
            "This question cannot be deleted because it is part of a started voting".to_owned(),
        ));
    }

    if db::delete_question(&mut conn, question_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound("Question not found".to_owned()))
    }
}

async fn store_vote(
    session: Session,
    State(AppState { pool, .. }): State<AppState>,
    body: Result<Json<StoreVote>, JsonRejection>,
) -> Result<Json<Vote>, Error> {
    let mut vote = json_body(body)?;
    let mut conn = pool.acquire().await?;
    let now = time::OffsetDateTime::now_utc();

    let voting = db::get_voting(&mut conn, vote.voting).await?;
    let Some(voting) = voting.filter(|voting| voting.is_open(now)) else {
        return Err(Error::Unauthorized("Voting is not open".to_owned()));
    };

    if session.user_id() != vote.voter {
        tracing::warn!(
            "User {} tried to vote as voter {}",
            session.user_id(),
            vote.voter
        );
        return Err(Error::Unauthorized("Invalid voter".to_owned()));
    }

    if !db::census_contains(&mut conn, voting.id, vote.voter).await? {
        return Err(Error::Unauthorized("Invalid voter".to_owned()));
    }

    let Some(pub_key) = voting.pub_key.as_ref() else {
        return Err(Error::Unauthorized("Voting is not open".to_owned()));
    };
    if let Err(e) = pub_key.check_ciphertext(&vote.vote) {
        tracing::warn!("Voter {} sent an invalid vote: {e}", vote.voter);
        return Err(Error::BadRequest("Invalid vote".to_owned()));
    }

    // a vote without a question is a vote for the first one
    if vote.question.is_none() {
        vote.question = voting.questions.first().map(|question| question.id);
    }

    let stored = db::upsert_vote(&mut conn, &vote, now).await?;
    tracing::info!("Stored vote {} in voting {}", stored.id, voting.id);
    Ok(Json(stored))
}

async fn list_votes(
    _session: StaffSession,
    State(AppState { pool, .. }): State<AppState>,
    Query(filter): Query<StoreFilter>,
) -> Result<Json<Vec<Vote>>, Error> {
    let mut conn = pool.acquire().await?;
    Ok(Json(db::list_votes(&mut conn, &filter).await?))
}

async fn get_booth(
    State(AppState { pool, settings, .. }): State<AppState>,
    Path((voting_id, question_id)): Path<(VotingId, QuestionId)>,
) -> Result<Json<BoothContext>, Error> {
    let mut conn = pool.acquire().await?;
    let voting = db::get_voting(&mut conn, voting_id)
        .await?
        .ok_or_else(|| Error::NotFound(BoothNotFound.to_string()))?;

    BoothContext::build(voting, question_id, settings.keybits)
        .map(Json)
        .map_err(|e| Error::NotFound(e.to_string()))
}

async fn get_visualizer(
    State(AppState { pool, .. }): State<AppState>,
    Path(voting_id): Path<VotingId>,
) -> Result<Json<VisualizerView>, Error> {
    let mut conn = pool.acquire().await?;
    db::get_voting(&mut conn, voting_id)
        .await?
        .map(|voting| Json(VisualizerView::from(voting)))
        .ok_or_else(|| Error::NotFound("Voting not found".to_owned()))
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(#[from] color_eyre::Report),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, json) = match self {
            Error::BadRequest(message) => (StatusCode::BAD_REQUEST, Json(message)),
            Error::Unauthorized(message) => (StatusCode::UNAUTHORIZED, Json(message)),
            Error::NotFound(message) => (StatusCode::NOT_FOUND, Json(message)),
            Error::Conflict(message) => (StatusCode::CONFLICT, Json(message)),
            Error::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(e.to_string())),
            Error::Other(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(e.to_string())),
        };
        tracing::error!("Responding with error: {status} {json:?}");
        (status, json).into_response()
    }
}
