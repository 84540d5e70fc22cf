use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("already closed")]
    AlreadyClosed,
}

impl Error {
    /// Stable numeric code for errors the host forwards to clients.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::Query(e) => Some(e.code()),
            Error::AlreadyClosed => Some(5101),
            _ => None,
        }
    }
}

/// Query rejections. Raised before any I/O is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("$where queries are disabled")]
    WhereDisabled,
    #[error("$mapReduce queries are disabled")]
    MapReduceDisabled,
    #[error("$aggregate queries are disabled")]
    AggregateDisabled,
    #[error("$query property deprecated in queries")]
    QueryDeprecated,
    #[error("Malformed query operator: {0}")]
    MalformedOperator(String),
    #[error("Only one collection operation allowed. Found {0} and {1}")]
    OnlyOneCollectionOperation(String, String),
    #[error("Only one cursor operation allowed. Found {0} and {1}")]
    OnlyOneCursorOperation(String, String),
    #[error("Cursor methods can't run after collection method {0}")]
    CursorAndCollectionMethod(String),
    #[error("Unsupported query: {0}")]
    Unsupported(String),
}

impl QueryError {
    pub fn code(&self) -> u16 {
        match self {
            QueryError::WhereDisabled => 4103,
            QueryError::MapReduceDisabled => 4104,
            QueryError::AggregateDisabled => 4105,
            QueryError::QueryDeprecated => 4106,
            QueryError::MalformedOperator(_) => 4107,
            QueryError::OnlyOneCollectionOperation(..) => 4108,
            QueryError::OnlyOneCursorOperation(..) => 4109,
            QueryError::CursorAndCollectionMethod(_) => 4110,
            QueryError::Unsupported(_) => 4111,
        }
    }
}
