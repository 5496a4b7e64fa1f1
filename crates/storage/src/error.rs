use snafu::Snafu;

/// Failures of the guest conversation stores.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("guest {entity} `{id}` not found on `{stage}`"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("`{raw}` is not a valid {id_type} on `{stage}`, {source}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("guest store rejected write on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create guest database directory {path} on `{stage}`, {source}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid guest database location `{database_url}` on `{stage}`, {source}"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to open guest database `{database_url}` on `{stage}`, {source}"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to migrate guest database on `{stage}`, {source}"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("guest database query failed on `{stage}`, {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
