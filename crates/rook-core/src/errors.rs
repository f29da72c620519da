use std::{borrow::Cow, fmt, time::Duration};

/// Stable, string-keyed identity of an error class.
///
/// The error funnel routes on this key, so extensions can introduce new kinds
/// without touching the core enum.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorKind(Cow<'static, str>);

impl ErrorKind {
    pub const fn from_static(s: &'static str) -> Self {
        Self(Cow::Borrowed(s))
    }

    pub fn new(s: impl Into<String>) -> Self {
        Self(Cow::Owned(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Built-in error kinds.
pub mod kinds {
    use super::ErrorKind;

    pub const CONFIG: ErrorKind = ErrorKind::from_static("config");
    pub const EXTENSION_ALREADY_LOADED: ErrorKind =
        ErrorKind::from_static("extension.already_loaded");
    pub const EXTENSION_NOT_FOUND: ErrorKind = ErrorKind::from_static("extension.not_found");
    pub const EXTENSION_NOT_LOADED: ErrorKind = ErrorKind::from_static("extension.not_loaded");
    pub const EXTENSION_SETUP: ErrorKind = ErrorKind::from_static("extension.setup");
    pub const EXTENSION_CONFLICT: ErrorKind = ErrorKind::from_static("extension.conflict");
    pub const EXTENSION_INVALID_COMMAND: ErrorKind =
        ErrorKind::from_static("extension.invalid_command");
    pub const COMMAND_NOT_FOUND: ErrorKind = ErrorKind::from_static("parse.command_not_found");
    pub const MISSING_ARGUMENT: ErrorKind = ErrorKind::from_static("parse.missing_argument");
    pub const BAD_ARGUMENT: ErrorKind = ErrorKind::from_static("parse.bad_argument");
    pub const CHECK_FAILURE: ErrorKind = ErrorKind::from_static("check.failure");
    pub const ON_COOLDOWN: ErrorKind = ErrorKind::from_static("ratelimit.cooldown");
    pub const HANDLER: ErrorKind = ErrorKind::from_static("handler.error");
    pub const TASK_NOT_FOUND: ErrorKind = ErrorKind::from_static("scheduler.task_not_found");
    pub const TASK_INVALID_STATE: ErrorKind = ErrorKind::from_static("scheduler.invalid_state");
    pub const TASK_FAILED: ErrorKind = ErrorKind::from_static("scheduler.task_failed");
    pub const SCHEDULER_STOPPED: ErrorKind = ErrorKind::from_static("scheduler.stopped");
    pub const USER_INPUT: ErrorKind = ErrorKind::from_static("user.input");
    pub const STORE: ErrorKind = ErrorKind::from_static("store");
    pub const IO: ErrorKind = ErrorKind::from_static("io");
    pub const JSON: ErrorKind = ErrorKind::from_static("json");
    pub const EXTERNAL: ErrorKind = ErrorKind::from_static("external");
    pub const CANCELLED: ErrorKind = ErrorKind::from_static("invocation.cancelled");
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the dispatch core
/// and the error funnel can treat failures uniformly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Check(#[from] CheckFailure),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Error class defined by an extension (routed by `kind`).
    #[error("{message}")]
    Domain { kind: ErrorKind, message: String },

    /// Uncaught fault inside a command, listener or task body.
    #[error("handler failed: {0:#}")]
    Handler(#[from] anyhow::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn domain(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Domain {
            kind,
            message: message.into(),
        }
    }

    /// A corrective message for the invoking user.
    pub fn user(message: impl Into<String>) -> Self {
        Self::domain(kinds::USER_INPUT, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => kinds::CONFIG,
            Self::Extension(e) => e.kind(),
            Self::Parse(e) => e.kind(),
            Self::Check(_) => kinds::CHECK_FAILURE,
            Self::RateLimit(_) => kinds::ON_COOLDOWN,
            Self::Scheduler(e) => e.kind(),
            Self::Domain { kind, .. } => kind.clone(),
            Self::Handler(_) => kinds::HANDLER,
            Self::Store(_) => kinds::STORE,
            Self::Io(_) => kinds::IO,
            Self::Json(_) => kinds::JSON,
            Self::External(_) => kinds::EXTERNAL,
            Self::Cancelled => kinds::CANCELLED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension {0:?} is already loaded")]
    AlreadyLoaded(String),

    #[error("extension {0:?} could not be found")]
    NotFound(String),

    #[error("extension {0:?} is not loaded")]
    NotLoaded(String),

    #[error("extension {name:?} failed during setup: {source}")]
    Setup {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("command {command:?} from {extension:?} is already registered by {owner:?}")]
    CommandConflict {
        extension: String,
        command: String,
        owner: String,
    },

    /// Task handler, error route or converter name claimed twice.
    #[error("{key:?} from {extension:?} is already registered by {owner:?}")]
    RouteConflict {
        extension: String,
        key: String,
        owner: String,
    },

    #[error("invalid command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },
}

impl ExtensionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyLoaded(_) => kinds::EXTENSION_ALREADY_LOADED,
            Self::NotFound(_) => kinds::EXTENSION_NOT_FOUND,
            Self::NotLoaded(_) => kinds::EXTENSION_NOT_LOADED,
            Self::Setup { .. } => kinds::EXTENSION_SETUP,
            Self::CommandConflict { .. } | Self::RouteConflict { .. } => {
                kinds::EXTENSION_CONFLICT
            }
            Self::InvalidCommand { .. } => kinds::EXTENSION_INVALID_COMMAND,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("command {0:?} not found")]
    CommandNotFound(String),

    #[error("{0} is a required argument that is missing")]
    MissingRequiredArgument(String),

    #[error("could not parse argument {parameter}: {reason}")]
    ArgumentParsing { parameter: String, reason: String },
}

impl ParseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CommandNotFound(_) => kinds::COMMAND_NOT_FOUND,
            Self::MissingRequiredArgument(_) => kinds::MISSING_ARGUMENT,
            Self::ArgumentParsing { .. } => kinds::BAD_ARGUMENT,
        }
    }
}

/// A check predicate refused the invocation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct CheckFailure {
    pub check: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("command {command:?} is on cooldown, retry after {retry_after:?}")]
    CommandOnCooldown {
        command: String,
        retry_after: Duration,
    },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::CommandOnCooldown { retry_after, .. } => *retry_after,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduled task {0} not found")]
    TaskNotFound(String),

    #[error("scheduled task {task_id} is {status}")]
    InvalidState { task_id: String, status: String },

    #[error("scheduled task {task_id} ({kind}) failed: {source}")]
    TaskFailed {
        task_id: String,
        kind: String,
        #[source]
        source: Box<Error>,
    },

    #[error("scheduler is stopped")]
    Stopped,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_) => kinds::TASK_NOT_FOUND,
            Self::InvalidState { .. } => kinds::TASK_INVALID_STATE,
            Self::TaskFailed { .. } => kinds::TASK_FAILED,
            Self::Stopped => kinds::SCHEDULER_STOPPED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_nested_variants() {
        let e: Error = ParseError::MissingRequiredArgument("count".to_string()).into();
        assert_eq!(e.kind(), kinds::MISSING_ARGUMENT);

        let e: Error = ExtensionError::NotLoaded("meta".to_string()).into();
        assert_eq!(e.kind().as_str(), "extension.not_loaded");

        let custom = ErrorKind::new("reminders.too_far");
        let e = Error::domain(custom.clone(), "too far in the future");
        assert_eq!(e.kind(), custom);
        assert_eq!(e.to_string(), "too far in the future");
    }

    #[test]
    fn handler_errors_wrap_anyhow() {
        let e: Error = anyhow::anyhow!("boom").into();
        assert_eq!(e.kind(), kinds::HANDLER);
        assert!(e.to_string().contains("boom"));
    }
}
