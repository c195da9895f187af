use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Store;
use crate::error::Error;
use crate::types::{HitlRequest, RequestStatus, Session};

/// Row type for reading sessions from PostgreSQL.
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    client_id: String,
    human_address: i64,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            client_id: row.client_id,
            human_address: row.human_address,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

/// Row type for reading requests from PostgreSQL.
#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    session_id: String,
    client_id: String,
    message: String,
    options: serde_json::Value,
    metadata: serde_json::Value,
    timeout_seconds: i64,
    status: String,
    response: Option<String>,
    approved: bool,
    created_at: DateTime<Utc>,
    responded_at: Option<DateTime<Utc>>,
    transport_message_id: Option<i32>,
}

fn status_to_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "pending",
        RequestStatus::Completed => "completed",
        RequestStatus::Timeout => "timeout",
        RequestStatus::Canceled => "canceled",
    }
}

fn str_to_status(s: &str) -> RequestStatus {
    match s {
        "completed" => RequestStatus::Completed,
        "timeout" => RequestStatus::Timeout,
        "canceled" => RequestStatus::Canceled,
        _ => RequestStatus::Pending,
    }
}

impl From<RequestRow> for HitlRequest {
    fn from(row: RequestRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            client_id: row.client_id,
            message: row.message,
            options: serde_json::from_value(row.options).unwrap_or_default(),
            metadata: serde_json::from_value(row.metadata).unwrap_or_default(),
            timeout_seconds: row.timeout_seconds.max(0) as u64,
            status: str_to_status(&row.status),
            response: row.response,
            approved: row.approved,
            created_at: row.created_at,
            responded_at: row.responded_at,
            transport_message_id: row.transport_message_id,
        }
    }
}

const REQUEST_COLUMNS: &str = "id, session_id, client_id, message, options, metadata, \
     timeout_seconds, status, response, approved, created_at, responded_at, \
     transport_message_id";

/// PostgreSQL-backed store for durable session and request persistence.
///
/// Uses `sqlx` runtime queries (no compile-time macros). Terminal transitions
/// are conditional `UPDATE ... WHERE status = 'pending'` statements; a
/// zero-row update is disambiguated into `NotFound` vs `AlreadyTerminal` by a
/// follow-up read. The `Store` trait is synchronous, so calls bridge into the
/// runtime via `block_in_place`.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    /// Create from an existing connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Connect to PostgreSQL using the given URL.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = sqlx::PgPool::connect(database_url)
            .await
            .map_err(|e| Error::Store(format!("database connection failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Run the schema migration. Safe to call multiple times.
    pub async fn run_migration(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hitl_sessions (
                session_id     TEXT PRIMARY KEY,
                client_id      TEXT NOT NULL,
                human_address  BIGINT NOT NULL,
                active         BOOLEAN NOT NULL DEFAULT TRUE,
                created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS idx_hitl_sessions_client_id
                ON hitl_sessions(client_id);

            CREATE TABLE IF NOT EXISTS hitl_requests (
                id                   UUID PRIMARY KEY,
                session_id           TEXT NOT NULL,
                client_id            TEXT NOT NULL,
                message              TEXT NOT NULL,
                options              JSONB NOT NULL DEFAULT '[]',
                metadata             JSONB NOT NULL DEFAULT '{}',
                timeout_seconds      BIGINT NOT NULL,
                status               TEXT NOT NULL DEFAULT 'pending',
                response             TEXT,
                approved             BOOLEAN NOT NULL DEFAULT FALSE,
                created_at           TIMESTAMPTZ NOT NULL,
                responded_at         TIMESTAMPTZ,
                transport_message_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_hitl_requests_status
                ON hitl_requests(status);
            CREATE INDEX IF NOT EXISTS idx_hitl_requests_created_at
                ON hitl_requests(created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Store(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Conditional terminal transition shared by complete/cancel/timeout.
    fn conditional_transition(
        &self,
        id: Uuid,
        target: RequestStatus,
        response: Option<&str>,
        approved: Option<bool>,
        responded_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        let pool = self.pool.clone();
        let response = response.map(str::to_string);
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let result = sqlx::query(
                    r#"UPDATE hitl_requests
                        SET status = $2, response = $3, approved = COALESCE($4, approved),
                            responded_at = $5
                    WHERE id = $1 AND status = 'pending'"#,
                )
                .bind(id)
                .bind(status_to_str(target))
                .bind(&response)
                .bind(approved)
                .bind(responded_at)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to transition request: {e}")))?;

                if result.rows_affected() > 0 {
                    return Ok(());
                }

                // Zero rows: either the request is unknown or already settled.
                let status: Option<String> =
                    sqlx::query_scalar("SELECT status FROM hitl_requests WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&pool)
                        .await
                        .map_err(|e| Error::Store(format!("failed to read request: {e}")))?;
                match status {
                    Some(_) => Err(Error::AlreadyTerminal(id)),
                    None => Err(Error::NotFound(format!("request {id}"))),
                }
            })
        })
    }
}

impl Store for PostgresStore {
    fn create_session(&self, session: Session) -> Result<(), Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let result = sqlx::query(
                    r#"INSERT INTO hitl_sessions
                        (session_id, client_id, human_address, active, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (session_id) DO NOTHING"#,
                )
                .bind(&session.session_id)
                .bind(&session.client_id)
                .bind(session.human_address)
                .bind(session.active)
                .bind(session.created_at)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to create session: {e}")))?;
                if result.rows_affected() == 0 {
                    return Err(Error::Duplicate(format!("session {}", session.session_id)));
                }
                Ok(())
            })
        })
    }

    fn reregister_session(&self, session: Session) -> Result<(), Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let result = sqlx::query(
                    r#"UPDATE hitl_sessions
                        SET client_id = $2, human_address = $3, active = TRUE, created_at = $4
                    WHERE session_id = $1 AND active = FALSE"#,
                )
                .bind(&session.session_id)
                .bind(&session.client_id)
                .bind(session.human_address)
                .bind(session.created_at)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to re-register session: {e}")))?;

                if result.rows_affected() > 0 {
                    return Ok(());
                }
                let exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM hitl_sessions WHERE session_id = $1)",
                )
                .bind(&session.session_id)
                .fetch_one(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to read session: {e}")))?;
                if exists {
                    Err(Error::Duplicate(format!("session {}", session.session_id)))
                } else {
                    Err(Error::NotFound(format!("session {}", session.session_id)))
                }
            })
        })
    }

    fn deactivate_session(&self, session_id: &str) -> Result<(), Error> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let result =
                    sqlx::query("UPDATE hitl_sessions SET active = FALSE WHERE session_id = $1")
                        .bind(&session_id)
                        .execute(&pool)
                        .await
                        .map_err(|e| Error::Store(format!("failed to deactivate session: {e}")))?;
                if result.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("session {session_id}")));
                }
                Ok(())
            })
        })
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, Error> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let row: Option<SessionRow> = sqlx::query_as(
                    "SELECT session_id, client_id, human_address, active, created_at \
                     FROM hitl_sessions WHERE session_id = $1",
                )
                .bind(&session_id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to get session: {e}")))?;
                Ok(row.map(Session::from))
            })
        })
    }

    fn list_active_sessions(&self) -> Result<Vec<Session>, Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let rows: Vec<SessionRow> = sqlx::query_as(
                    "SELECT session_id, client_id, human_address, active, created_at \
                     FROM hitl_sessions WHERE active ORDER BY created_at",
                )
                .fetch_all(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to list sessions: {e}")))?;
                Ok(rows.into_iter().map(Session::from).collect())
            })
        })
    }

    fn active_sessions_for_client(&self, client_id: &str) -> Result<Vec<Session>, Error> {
        let pool = self.pool.clone();
        let client_id = client_id.to_string();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let rows: Vec<SessionRow> = sqlx::query_as(
                    "SELECT session_id, client_id, human_address, active, created_at \
                     FROM hitl_sessions WHERE active AND client_id = $1 ORDER BY created_at",
                )
                .bind(&client_id)
                .fetch_all(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to resolve client sessions: {e}")))?;
                Ok(rows.into_iter().map(Session::from).collect())
            })
        })
    }

    fn create_request(&self, request: HitlRequest) -> Result<(), Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let options = serde_json::to_value(&request.options)?;
                let metadata = serde_json::to_value(&request.metadata)?;
                let result = sqlx::query(
                    r#"INSERT INTO hitl_requests
                        (id, session_id, client_id, message, options, metadata,
                         timeout_seconds, status, response, approved, created_at,
                         responded_at, transport_message_id)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                    ON CONFLICT (id) DO NOTHING"#,
                )
                .bind(request.id)
                .bind(&request.session_id)
                .bind(&request.client_id)
                .bind(&request.message)
                .bind(options)
                .bind(metadata)
                .bind(request.timeout_seconds as i64)
                .bind(status_to_str(request.status))
                .bind(&request.response)
                .bind(request.approved)
                .bind(request.created_at)
                .bind(request.responded_at)
                .bind(request.transport_message_id)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to create request: {e}")))?;
                if result.rows_affected() == 0 {
                    return Err(Error::Duplicate(format!("request {}", request.id)));
                }
                Ok(())
            })
        })
    }

    fn create_request_bounded(
        &self,
        request: HitlRequest,
        max_pending: usize,
    ) -> Result<(), Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let options = serde_json::to_value(&request.options)?;
                let metadata = serde_json::to_value(&request.metadata)?;
                // Ceiling check and insert in one statement; a zero-row
                // result is disambiguated into Duplicate vs Overloaded.
                let result = sqlx::query(
                    r#"INSERT INTO hitl_requests
                        (id, session_id, client_id, message, options, metadata,
                         timeout_seconds, status, response, approved, created_at,
                         responded_at, transport_message_id)
                    SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
                    WHERE (SELECT COUNT(*) FROM hitl_requests WHERE status = 'pending') < $14
                    ON CONFLICT (id) DO NOTHING"#,
                )
                .bind(request.id)
                .bind(&request.session_id)
                .bind(&request.client_id)
                .bind(&request.message)
                .bind(options)
                .bind(metadata)
                .bind(request.timeout_seconds as i64)
                .bind(status_to_str(request.status))
                .bind(&request.response)
                .bind(request.approved)
                .bind(request.created_at)
                .bind(request.responded_at)
                .bind(request.transport_message_id)
                .bind(max_pending as i64)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to create request: {e}")))?;

                if result.rows_affected() > 0 {
                    return Ok(());
                }
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM hitl_requests WHERE id = $1)")
                        .bind(request.id)
                        .fetch_one(&pool)
                        .await
                        .map_err(|e| Error::Store(format!("failed to read request: {e}")))?;
                if exists {
                    Err(Error::Duplicate(format!("request {}", request.id)))
                } else {
                    Err(Error::Overloaded(max_pending))
                }
            })
        })
    }

    fn get_request(&self, id: Uuid) -> Result<Option<HitlRequest>, Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let row: Option<RequestRow> = sqlx::query_as(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM hitl_requests WHERE id = $1"
                ))
                .bind(id)
                .fetch_optional(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to get request: {e}")))?;
                Ok(row.map(HitlRequest::from))
            })
        })
    }

    fn update_request_response(
        &self,
        id: Uuid,
        response: &str,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.conditional_transition(
            id,
            RequestStatus::Completed,
            Some(response),
            Some(approved),
            Some(now),
        )
    }

    fn cancel_request(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), Error> {
        self.conditional_transition(id, RequestStatus::Canceled, None, None, None)
    }

    fn timeout_request(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), Error> {
        self.conditional_transition(id, RequestStatus::Timeout, None, None, None)
    }

    fn attach_transport_message(&self, id: Uuid, transport_message_id: i32) -> Result<(), Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let result = sqlx::query(
                    "UPDATE hitl_requests SET transport_message_id = $2 \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(id)
                .bind(transport_message_id)
                .execute(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to attach message id: {e}")))?;

                if result.rows_affected() > 0 {
                    return Ok(());
                }
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM hitl_requests WHERE id = $1)")
                        .bind(id)
                        .fetch_one(&pool)
                        .await
                        .map_err(|e| Error::Store(format!("failed to read request: {e}")))?;
                if exists {
                    // Request settled between send and persist; attributes are frozen.
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("request {id}")))
                }
            })
        })
    }

    fn list_pending_requests(&self) -> Result<Vec<HitlRequest>, Error> {
        let pool = self.pool.clone();
        tokio::task::block_in_place(move || {
            tokio::runtime::Handle::current().block_on(async move {
                let rows: Vec<RequestRow> = sqlx::query_as(&format!(
                    "SELECT {REQUEST_COLUMNS} FROM hitl_requests \
                     WHERE status = 'pending' ORDER BY created_at"
                ))
                .fetch_all(&pool)
                .await
                .map_err(|e| Error::Store(format!("failed to list pending requests: {e}")))?;
                Ok(rows.into_iter().map(HitlRequest::from).collect())
            })
        })
    }
}
