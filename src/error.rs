use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("timeout")]
    Timeout,
    #[error("could not connect host")]
    CouldNotConnectHost,
    #[error("authentication failed")]
    AuthError,
    #[error("bad protocol: {0}")]
    BadProtocol(String),
    #[error("connection error")]
    ConnectionError,
    #[error("connection reset")]
    ConnectionReset,
    #[error("exists already")]
    ExistsAlready,
    #[error("not found")]
    NotFound,
    #[error("canceled")]
    Canceled,
    #[error("not initialized")]
    NotInitialized,
    #[error("wrong state")]
    WrongState,
    #[error("length exceeds 31 bits")]
    TooMuch,
    #[error("not enough data")]
    NotEnough,
    #[error("{} sends failed", .0.len())]
    MultipleErrors(Vec<Error>),
    #[error("channel error")]
    ChannelError,
    #[error("closed")]
    Closed,
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(Arc<io::Error>),
    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Error::CouldNotConnectHost,
            _ => Error::Io(Arc::new(e)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadProtocol(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl Error {
    /// Stable name used when an error travels over the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Timeout => "TimeOut",
            Error::CouldNotConnectHost => "CouldNotConnectHost",
            Error::AuthError => "AuthError",
            Error::BadProtocol(_) => "BadProtocol",
            Error::ConnectionError => "ConnectionError",
            Error::ConnectionReset => "ConnectionReset",
            Error::ExistsAlready => "ExistsAlready",
            Error::NotFound => "NotFound",
            Error::Canceled => "Canceled",
            Error::NotInitialized => "NotInitialized",
            Error::WrongState => "WrongState",
            Error::TooMuch => "TooMuch",
            Error::NotEnough => "NotEnough",
            Error::MultipleErrors(_) => "MultipleErrors",
            Error::ChannelError => "ChannelError",
            Error::Closed => "Closed",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::Io(_) => "IoError",
            Error::Other(_) => "Other",
        }
    }

    pub fn from_name(name: &str) -> Error {
        match name {
            "TimeOut" => Error::Timeout,
            "CouldNotConnectHost" => Error::CouldNotConnectHost,
            "AuthError" => Error::AuthError,
            "BadProtocol" => Error::BadProtocol("remote".into()),
            "ConnectionError" => Error::ConnectionError,
            "ConnectionReset" => Error::ConnectionReset,
            "ExistsAlready" => Error::ExistsAlready,
            "NotFound" => Error::NotFound,
            "Canceled" => Error::Canceled,
            "NotInitialized" => Error::NotInitialized,
            "WrongState" => Error::WrongState,
            "TooMuch" => Error::TooMuch,
            "NotEnough" => Error::NotEnough,
            "ChannelError" => Error::ChannelError,
            "Closed" => Error::Closed,
            other => Error::Other(other.to_string()),
        }
    }

    /// Collapses the errors of a fan-out operation.
    pub fn collect(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::MultipleErrors(errors)),
        }
    }
}
