use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration: {message}")]
    Configuration { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Query ID {query_id} does not exist in DBM. Has it been run before downloading?")]
    QueryNotFound { query_id: i64 },

    #[error("Query ID {query_id} is still running")]
    QueryRunning { query_id: i64 },

    #[error("Query ID {query_id} still running after {attempts} status checks")]
    PollLimitExceeded { query_id: i64, attempts: u32 },

    #[error("API responded with error: {0}")]
    ApiFailure(#[from] reqwest::Error),

    #[error("Failed to parse URL: {0}")]
    UrlParsingFailed(#[from] url::ParseError),

    #[error("Authorization failed: {message}")]
    Auth { message: String },

    #[error("Failed to sign token assertion: {0}")]
    TokenSigning(#[from] jsonwebtoken::errors::Error),

    #[error("'The date supplied {date} is invalid'")]
    InvalidDate { date: String },

    #[error("'{value}' is not a valid amount")]
    InvalidAmount { value: String },

    #[error("'{value}' is not a valid count")]
    InvalidCount { value: String },

    #[error("Report is missing the '{column}' column")]
    MissingColumn { column: String },

    #[error("Line {line}, column '{column}': {source}")]
    InvalidField {
        line: u64,
        column: String,
        #[source]
        source: Box<Error>,
    },

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{table} already holds ID {id}")]
    DuplicateDimension { table: String, id: i64 },

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    NoData { message: String },
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }
}
