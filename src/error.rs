use std::fmt;

/// A basic error type from this library.
///
/// Several variants double as the status codes the engine reports back to
/// callers of the daemon API (for example starting a service twice, or
/// registering a second DNS-SD service while one is active).
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// Error during parsing of ip address
    ParseIpAddr(String),

    /// The requested service is not running.
    NotRunning,

    /// The requested service is already running.
    AlreadyRunning,

    /// A DNS-SD service of this kind is already registered.
    AlreadyRegistered,

    /// Probing (or another startup step) has not finished yet.
    InProgress,

    /// A caller-supplied parameter failed validation.
    InvalidParam(String),

    /// No matching record was found within the wait budget.
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Msg(s) => write!(f, "{}", s),
            Self::ParseIpAddr(s) => write!(f, "parsing of ip addr failed, reason: {}", s),
            Self::Again => write!(f, "try again"),
            Self::NotRunning => write!(f, "service is not running"),
            Self::AlreadyRunning => write!(f, "service is already running"),
            Self::AlreadyRegistered => write!(f, "service is already registered"),
            Self::InProgress => write!(f, "operation still in progress"),
            Self::InvalidParam(s) => write!(f, "invalid parameter: {}", s),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;
