use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::api::ErrorResponse;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The closed set of error kinds the engine distinguishes.
///
/// Every variant here is expected to be matched on somewhere (job retirement,
/// the HTTP boundary, or a caller deciding whether to retry) - if you're
/// tempted to add a new variant "just in case", fold it into `Io` or
/// `Storage` instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("delta is not possible between these two packages")]
    MismatchedDelta,

    #[error("delta would be pointless, no files differ")]
    DeltaPointless,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("no job available")]
    EmptyQueue,

    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("storage error")]
    Storage(#[from] sled::Error),

    #[error("storage transaction error")]
    Transaction(String),

    #[error("codec error")]
    Codec(#[from] bincode::Error),

    #[error("xml error")]
    Xml(#[from] quick_xml::Error),

    #[error("xml attribute error")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
}

impl<T> From<sled::transaction::TransactionError<T>> for Error
where
    T: std::fmt::Debug,
{
    fn from(err: sled::transaction::TransactionError<T>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => {
                Error::Transaction(format!("{inner:?}"))
            }
            sled::transaction::TransactionError::Storage(err) => Error::Storage(err),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::InvalidArgument(_) | Error::UnknownJobKind(_) => StatusCode::BAD_REQUEST,
            Error::MismatchedDelta => StatusCode::UNPROCESSABLE_ENTITY,
            Error::DeltaPointless => StatusCode::UNPROCESSABLE_ENTITY,
            Error::EmptyQueue => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Corrupt(_)
            | Error::Io(_)
            | Error::Storage(_)
            | Error::Transaction(_)
            | Error::Codec(_)
            | Error::Xml(_)
            | Error::XmlAttr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ErrorResponse::new(status, error_code(&self), self.to_string()).into_response()
    }
}

fn error_code(err: &Error) -> String {
    let code = match err {
        Error::NotFound(_) => "NOT_FOUND",
        Error::AlreadyExists(_) => "ALREADY_EXISTS",
        Error::InvalidArgument(_) => "INVALID_ARGUMENT",
        Error::UnknownJobKind(_) => "UNKNOWN_JOB_KIND",
        Error::MismatchedDelta => "MISMATCHED_DELTA",
        Error::DeltaPointless => "DELTA_POINTLESS",
        Error::EmptyQueue => "EMPTY_QUEUE",
        Error::Corrupt(_) => "CORRUPT_RECORD",
        Error::Io(_) => "IO_ERROR",
        Error::Storage(_) | Error::Transaction(_) => "STORAGE_ERROR",
        Error::Codec(_) => "CODEC_ERROR",
        Error::Xml(_) | Error::XmlAttr(_) => "XML_ERROR",
    };
    code.to_string()
}
