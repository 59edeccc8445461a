//! Database access for the application.
//!
//! All direct use of [SQLx][`sqlx`] queries should be in this module. Queries
//! are checked at runtime, so no query metadata needs to be prepared for
//! offline builds.

use std::{collections::HashMap, time::Duration};

use mixcrypt::{BigInt, KeyPair, PublicKey};
use sqlx::{
    self, error::ErrorKind, postgres::PgPoolOptions, types::Json, Connection, FromRow,
    PgConnection, PgPool,
};
use time::OffsetDateTime;
use tracing::Level;
use types_rs::{
    auth::{NewUser, User},
    census::{Census, CsvImportSummary, CsvUpload},
    postproc::PostprocOption,
    store::{StoreFilter, StoreVote, Vote},
    voting::{Auth, NewAuth, NewVoting, Question, QuestionOption, QuestionTally, Voting},
    QuestionId, VoterId, VotingId,
};

use crate::config::Config;

/// Sets up the database pool and runs any pending migrations, returning the
/// pool to be used by the app.
pub async fn setup(config: &Config) -> color_eyre::Result<PgPool> {
    let _entered = tracing::span!(Level::DEBUG, "Setting up database").entered();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(3))
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("db/migrations").run(&pool).await?;
    Ok(pool)
}

/// Whether `error` is a constraint violation (unique, foreign key, not null
/// or check) rather than a failure of the database itself.
pub fn is_integrity_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(e) => !matches!(e.kind(), ErrorKind::Other),
        _ => false,
    }
}

fn decode_error(error: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(error))
}

fn encode_error(error: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Encode(Box::new(error))
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i32,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    password: String,
    is_staff: bool,
    is_superuser: bool,
    is_active: bool,
}

impl UserRow {
    fn into_user(self) -> (User, String) {
        (
            User {
                id: self.id,
                username: self.username,
                email: self.email,
                first_name: self.first_name,
                last_name: self.last_name,
                is_staff: self.is_staff,
                is_superuser: self.is_superuser,
                is_active: self.is_active,
            },
            self.password,
        )
    }
}

const USER_COLUMNS: &str =
    "id, username, email, first_name, last_name, password, is_staff, is_superuser, is_active";

pub async fn create_user(
    connection: &mut PgConnection,
    user: &NewUser,
    password_hash: &str,
) -> sqlx::Result<User> {
    let row: UserRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO users (username, email, first_name, last_name, password, is_staff, is_superuser)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {USER_COLUMNS}
        "#
    ))
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(password_hash)
    .bind(user.is_staff)
    .bind(user.is_superuser)
    .fetch_one(&mut *connection)
    .await?;

    Ok(row.into_user().0)
}

/// Finds an active user by username or, failing that, by email address.
/// Returns the user along with their password hash.
pub async fn get_user_for_login(
    connection: &mut PgConnection,
    username_or_email: &str,
) -> sqlx::Result<Option<(User, String)>> {
    let row: Option<UserRow> = sqlx::query_as(&format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM users
        WHERE is_active AND (username = $1 OR (email <> '' AND email = $1))
        ORDER BY username = $1 DESC, id
        LIMIT 1
        "#
    ))
    .bind(username_or_email)
    .fetch_optional(&mut *connection)
    .await?;

    Ok(row.map(UserRow::into_user))
}

pub async fn get_user(connection: &mut PgConnection, user_id: VoterId) -> sqlx::Result<Option<User>> {
    let row: Option<UserRow> =
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&mut *connection)
            .await?;

    Ok(row.map(|row| row.into_user().0))
}

/// Adds voters to the census of a voting. Either every voter is added or,
/// if any pair already exists, none are.
pub async fn create_census(
    connection: &mut PgConnection,
    voting_id: VotingId,
    voters: &[VoterId],
) -> sqlx::Result<()> {
    let mut txn = connection.begin().await?;

    for voter_id in voters {
        sqlx::query("INSERT INTO census (voting_id, voter_id) VALUES ($1, $2)")
            .bind(voting_id)
            .bind(voter_id)
            .execute(&mut *txn)
            .await?;
    }

    txn.commit().await?;
    Ok(())
}

pub async fn list_census(
    connection: &mut PgConnection,
    voting_id: VotingId,
) -> sqlx::Result<Vec<VoterId>> {
    sqlx::query_scalar("SELECT voter_id FROM census WHERE voting_id = $1 ORDER BY voter_id")
        .bind(voting_id)
        .fetch_all(&mut *connection)
        .await
}

/// Removes voters from the census of a voting, returning how many were removed.
pub async fn delete_census(
    connection: &mut PgConnection,
    voting_id: VotingId,
    voters: &[VoterId],
) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM census WHERE voting_id = $1 AND voter_id = ANY($2)")
        .bind(voting_id)
        .bind(voters.to_vec())
        .execute(&mut *connection)
        .await?;
    Ok(result.rows_affected())
}

pub async fn census_contains(
    connection: &mut PgConnection,
    voting_id: VotingId,
    voter_id: VoterId,
) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM census WHERE voting_id = $1 AND voter_id = $2)",
    )
    .bind(voting_id)
    .bind(voter_id)
    .fetch_one(&mut *connection)
    .await
}

#[derive(Debug, FromRow)]
struct CsvUploadRow {
    id: i32,
    file_name: String,
    uploaded: OffsetDateTime,
    activated: bool,
}

impl From<CsvUploadRow> for CsvUpload {
    fn from(row: CsvUploadRow) -> Self {
        Self {
            id: row.id,
            file_name: row.file_name,
            uploaded: row.uploaded,
            activated: row.activated,
        }
    }
}

/// Records a received census file. It is not activated until its rows are
/// imported with [`import_census_upload`].
pub async fn create_census_upload(
    connection: &mut PgConnection,
    file_name: &str,
    contents: &str,
) -> sqlx::Result<CsvUpload> {
    let row: CsvUploadRow = sqlx::query_as(
        r#"
        INSERT INTO census_uploads (file_name, contents)
        VALUES ($1, $2)
        RETURNING id, file_name, uploaded, activated
        "#,
    )
    .bind(file_name)
    .bind(contents)
    .fetch_one(&mut *connection)
    .await?;

    Ok(row.into())
}

/// Imports the rows of an uploaded census file and activates the upload.
/// Rows already in the census are skipped.
pub async fn import_census_upload(
    connection: &mut PgConnection,
    upload_id: i32,
    rows: &[Census],
) -> sqlx::Result<CsvImportSummary> {
    let mut txn = connection.begin().await?;
    let mut summary = CsvImportSummary {
        imported: 0,
        skipped: 0,
    };

    for row in rows {
        let result = sqlx::query(
            r#"
            INSERT INTO census (voting_id, voter_id)
            VALUES ($1, $2)
            ON CONFLICT (voting_id, voter_id) DO NOTHING
            "#,
        )
        .bind(row.voting_id)
        .bind(row.voter_id)
        .execute(&mut *txn)
        .await?;

        if result.rows_affected() == 0 {
            summary.skipped += 1;
        } else {
            summary.imported += 1;
        }
    }

    sqlx::query("UPDATE census_uploads SET activated = TRUE WHERE id = $1")
        .bind(upload_id)
        .execute(&mut *txn)
        .await?;

    txn.commit().await?;
    Ok(summary)
}

pub async fn list_census_uploads(connection: &mut PgConnection) -> sqlx::Result<Vec<CsvUpload>> {
    let rows: Vec<CsvUploadRow> = sqlx::query_as(
        "SELECT id, file_name, uploaded, activated FROM census_uploads ORDER BY id",
    )
    .fetch_all(&mut *connection)
    .await?;

    Ok(rows.into_iter().map(CsvUpload::from).collect())
}

pub async fn delete_census_upload(connection: &mut PgConnection, upload_id: i32) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM census_uploads WHERE id = $1")
        .bind(upload_id)
        .execute(&mut *connection)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, FromRow)]
struct VotingRow {
    id: i32,
    name: String,
    description: String,
    start_date: Option<OffsetDateTime>,
    end_date: Option<OffsetDateTime>,
    pub_key: Option<Json<PublicKey>>,
    tally: Option<Json<Vec<QuestionTally>>>,
    postproc: Option<Json<Vec<PostprocOption>>>,
    total_votes: Option<i64>,
}

#[derive(Debug, FromRow)]
struct QuestionRow {
    id: i32,
    description: String,
}

#[derive(Debug, FromRow)]
struct QuestionOptionRow {
    question_id: i32,
    number: i32,
    option: String,
}

#[derive(Debug, FromRow)]
struct AuthRow {
    id: i32,
    name: String,
    url: String,
    me: bool,
}

/// Creates a voting along with its questions and authorities. If the voting
/// names no authorities, `default_auth` is used. An authority whose URL is
/// `local_url` is marked as run by this server.
pub async fn create_voting(
    connection: &mut PgConnection,
    voting: &NewVoting,
    default_auth: &NewAuth,
    local_url: &str,
) -> sqlx::Result<VotingId> {
    let mut txn = connection.begin().await?;

    let voting_id: VotingId =
        sqlx::query_scalar("INSERT INTO votings (name, description) VALUES ($1, $2) RETURNING id")
            .bind(&voting.name)
            .bind(&voting.desc)
            .fetch_one(&mut *txn)
            .await?;

    for (position, question) in voting.question.iter().enumerate() {
        let question_id: QuestionId =
            sqlx::query_scalar("INSERT INTO questions (description) VALUES ($1) RETURNING id")
                .bind(&question.desc)
                .fetch_one(&mut *txn)
                .await?;

        for option in question.numbered_options() {
            sqlx::query(
                "INSERT INTO question_options (question_id, number, option) VALUES ($1, $2, $3)",
            )
            .bind(question_id)
            .bind(i32::try_from(option.number).map_err(encode_error)?)
            .bind(&option.option)
            .execute(&mut *txn)
            .await?;
        }

        sqlx::query(
            "INSERT INTO voting_questions (voting_id, question_id, position) VALUES ($1, $2, $3)",
        )
        .bind(voting_id)
        .bind(question_id)
        .bind(i32::try_from(position).map_err(encode_error)?)
        .execute(&mut *txn)
        .await?;
    }

    let auths = if voting.auths.is_empty() {
        std::slice::from_ref(default_auth)
    } else {
        voting.auths.as_slice()
    };

    for auth in auths {
        let auth_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO auths (name, url, me)
            VALUES ($1, $2, $3)
            ON CONFLICT (url) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(&auth.name)
        .bind(&auth.url)
        .bind(auth.url == local_url)
        .fetch_one(&mut *txn)
        .await?;

        sqlx::query(
            "INSERT INTO voting_auths (voting_id, auth_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(voting_id)
        .bind(auth_id)
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await?;
    Ok(voting_id)
}

/// Lists votings ordered by ID, or only the one with `voting_id`.
pub async fn list_votings(
    connection: &mut PgConnection,
    voting_id: Option<VotingId>,
) -> sqlx::Result<Vec<Voting>> {
    let rows: Vec<VotingRow> = sqlx::query_as(
        r#"
        SELECT id, name, description, start_date, end_date, pub_key, tally, postproc, total_votes
        FROM votings
        WHERE ($1::INTEGER IS NULL OR id = $1)
        ORDER BY id
        "#,
    )
    .bind(voting_id)
    .fetch_all(&mut *connection)
    .await?;

    let mut votings = Vec::with_capacity(rows.len());
    for row in rows {
        votings.push(load_voting(connection, row).await?);
    }
    Ok(votings)
}

pub async fn get_voting(
    connection: &mut PgConnection,
    voting_id: VotingId,
) -> sqlx::Result<Option<Voting>> {
    Ok(list_votings(connection, Some(voting_id)).await?.pop())
}

async fn load_voting(connection: &mut PgConnection, row: VotingRow) -> sqlx::Result<Voting> {
    let question_rows: Vec<QuestionRow> = sqlx::query_as(
        r#"
        SELECT q.id, q.description
        FROM questions q
        JOIN voting_questions vq ON vq.question_id = q.id
        WHERE vq.voting_id = $1
        ORDER BY vq.position
        "#,
    )
    .bind(row.id)
    .fetch_all(&mut *connection)
    .await?;
    let questions = attach_options(connection, question_rows).await?;

    let auths: Vec<AuthRow> = sqlx::query_as(
        r#"
        SELECT a.id, a.name, a.url, a.me
        FROM auths a
        JOIN voting_auths va ON va.auth_id = a.id
        WHERE va.voting_id = $1
        ORDER BY a.id
        "#,
    )
    .bind(row.id)
    .fetch_all(&mut *connection)
    .await?;

    let census_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM census WHERE voting_id = $1")
        .bind(row.id)
        .fetch_one(&mut *connection)
        .await?;

    Ok(Voting {
        id: row.id,
        name: row.name,
        desc: row.description,
        questions,
        start_date: row.start_date,
        end_date: row.end_date,
        pub_key: row.pub_key.map(|Json(pub_key)| pub_key),
        auths: auths
            .into_iter()
            .map(|auth| Auth {
                id: auth.id,
                name: auth.name,
                url: auth.url,
                me: auth.me,
            })
            .collect(),
        tally: row.tally.map(|Json(tally)| tally),
        postproc: row.postproc.map(|Json(postproc)| postproc),
        total_votes: row.total_votes,
        census_total,
    })
}

async fn attach_options(
    connection: &mut PgConnection,
    rows: Vec<QuestionRow>,
) -> sqlx::Result<Vec<Question>> {
    let question_ids: Vec<QuestionId> = rows.iter().map(|row| row.id).collect();
    let option_rows: Vec<QuestionOptionRow> = sqlx::query_as(
        r#"
        SELECT question_id, number, option
        FROM question_options
        WHERE question_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(question_ids)
    .fetch_all(&mut *connection)
    .await?;

    let mut options: HashMap<QuestionId, Vec<QuestionOption>> = HashMap::new();
    for option in option_rows {
        options
            .entry(option.question_id)
            .or_default()
            .push(QuestionOption {
                number: u32::try_from(option.number).map_err(decode_error)?,
                option: option.option,
            });
    }

    Ok(rows
        .into_iter()
        .map(|row| Question {
            options: options.remove(&row.id).unwrap_or_default(),
            id: row.id,
            desc: row.description,
        })
        .collect())
}

/// Opens a voting: stores the key shares of its authorities and the combined
/// public key, sets the start date and adds every superuser to the census.
/// Returns `false` if the voting had already been started.
pub async fn start_voting(
    connection: &mut PgConnection,
    voting_id: VotingId,
    key_pairs: &[(i32, KeyPair)],
    pub_key: &PublicKey,
    start_date: OffsetDateTime,
) -> sqlx::Result<bool> {
    let mut txn = connection.begin().await?;

    let result = sqlx::query(
        "UPDATE votings SET pub_key = $2, start_date = $3 WHERE id = $1 AND start_date IS NULL",
    )
    .bind(voting_id)
    .bind(Json(pub_key))
    .bind(start_date)
    .execute(&mut *txn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(false);
    }

    for (auth_id, key_pair) in key_pairs {
        sqlx::query("INSERT INTO mixnet_keys (voting_id, auth_id, key_pair) VALUES ($1, $2, $3)")
            .bind(voting_id)
            .bind(auth_id)
            .bind(Json(key_pair))
            .execute(&mut *txn)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO census (voting_id, voter_id)
        SELECT $1, id FROM users WHERE is_superuser
        ON CONFLICT (voting_id, voter_id) DO NOTHING
        "#,
    )
    .bind(voting_id)
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;
    Ok(true)
}

/// Closes a started voting. Returns `false` if it was not open.
pub async fn stop_voting(
    connection: &mut PgConnection,
    voting_id: VotingId,
    end_date: OffsetDateTime,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE votings SET end_date = $2
        WHERE id = $1 AND start_date IS NOT NULL AND end_date IS NULL
        "#,
    )
    .bind(voting_id)
    .bind(end_date)
    .execute(&mut *connection)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Stores the result of a tally. Returns `false` if the voting was not
/// stopped or already tallied.
pub async fn save_tally(
    connection: &mut PgConnection,
    voting_id: VotingId,
    tally: &[QuestionTally],
    postproc: &[PostprocOption],
    total_votes: i64,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE votings SET tally = $2, postproc = $3, total_votes = $4
        WHERE id = $1 AND end_date IS NOT NULL AND tally IS NULL
        "#,
    )
    .bind(voting_id)
    .bind(Json(tally))
    .bind(Json(postproc))
    .bind(total_votes)
    .execute(&mut *connection)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The key shares of a voting, in authority order.
pub async fn get_key_pairs(
    connection: &mut PgConnection,
    voting_id: VotingId,
) -> sqlx::Result<Vec<KeyPair>> {
    let key_pairs: Vec<Json<KeyPair>> = sqlx::query_scalar(
        "SELECT key_pair FROM mixnet_keys WHERE voting_id = $1 ORDER BY auth_id",
    )
    .bind(voting_id)
    .fetch_all(&mut *connection)
    .await?;
    Ok(key_pairs.into_iter().map(|Json(key_pair)| key_pair).collect())
}

pub async fn delete_voting(connection: &mut PgConnection, voting_id: VotingId) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM votings WHERE id = $1")
        .bind(voting_id)
        .execute(&mut *connection)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_questions(connection: &mut PgConnection) -> sqlx::Result<Vec<Question>> {
    let rows: Vec<QuestionRow> = sqlx::query_as("SELECT id, description FROM questions ORDER BY id")
        .fetch_all(&mut *connection)
        .await?;
    attach_options(connection, rows).await
}

/// Whether the question belongs to a voting that has been started.
pub async fn question_in_started_voting(
    connection: &mut PgConnection,
    question_id: QuestionId,
) -> sqlx::Result<bool> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM voting_questions vq
            JOIN votings v ON v.id = vq.voting_id
            WHERE vq.question_id = $1 AND v.start_date IS NOT NULL
        )
        "#,
    )
    .bind(question_id)
    .fetch_one(&mut *connection)
    .await
}

pub async fn delete_question(
    connection: &mut PgConnection,
    question_id: QuestionId,
) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM questions WHERE id = $1")
        .bind(question_id)
        .execute(&mut *connection)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, FromRow)]
struct VoteRow {
    id: i32,
    voting_id: i32,
    voter_id: i32,
    question_id: Option<i32>,
    a: String,
    b: String,
    voted: OffsetDateTime,
}

impl TryFrom<VoteRow> for Vote {
    type Error = sqlx::Error;

    fn try_from(row: VoteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            voting_id: row.voting_id,
            voter_id: row.voter_id,
            question_id: row.question_id,
            a: row.a.parse::<BigInt>().map_err(decode_error)?,
            b: row.b.parse::<BigInt>().map_err(decode_error)?,
            voted: row.voted,
        })
    }
}

/// Stores a vote, replacing the voter's previous vote for the same voting
/// and question.
pub async fn upsert_vote(
    connection: &mut PgConnection,
    vote: &StoreVote,
    voted: OffsetDateTime,
) -> sqlx::Result<Vote> {
    let row: VoteRow = sqlx::query_as(
        r#"
        INSERT INTO votes (voting_id, voter_id, question_id, a, b, voted)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (voting_id, voter_id, (COALESCE(question_id, 0)))
        DO UPDATE SET a = EXCLUDED.a, b = EXCLUDED.b, voted = EXCLUDED.voted
        RETURNING id, voting_id, voter_id, question_id, a, b, voted
        "#,
    )
    .bind(vote.voting)
    .bind(vote.voter)
    .bind(vote.question)
    .bind(vote.vote.a.to_string())
    .bind(vote.vote.b.to_string())
    .bind(voted)
    .fetch_one(&mut *connection)
    .await?;

    row.try_into()
}

pub async fn list_votes(connection: &mut PgConnection, filter: &StoreFilter) -> sqlx::Result<Vec<Vote>> {
    let rows: Vec<VoteRow> = sqlx::query_as(
        r#"
        SELECT id, voting_id, voter_id, question_id, a, b, voted
        FROM votes
        WHERE ($1::INTEGER IS NULL OR voting_id = $1)
          AND ($2::INTEGER IS NULL OR voter_id = $2)
        ORDER BY id
        "#,
    )
    .bind(filter.voting_id)
    .bind(filter.voter_id)
    .fetch_all(&mut *connection)
    .await?;

    rows.into_iter().map(Vote::try_from).collect()
}
