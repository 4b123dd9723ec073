//! Error types for the bot.

use teloxide::{ApiError, RequestError};
use thiserror::Error;

/// Problems found while reading the environment. All of them abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TELEGRAM_BOT_TOKEN is missing. Set it in the environment or a .env file.")]
    MissingToken,

    #[error("TELEGRAM_BOT_TOKEN is malformed (expected <bot id>:<secret>)")]
    MalformedToken,

    #[error("{key}={value:?} is not valid: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures reported by the bot client, already sorted into the classes the
/// supervisor and the handlers care about.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Another process is polling with the same token.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("request timed out")]
    Timeout,

    /// The client could not be built (bad proxy settings, TLS backend, ...).
    #[error("client construction failed: {0}")]
    Construction(String),
}

impl ClientError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Timeout)
    }
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Api(api) => classify_api_error(api),
            e @ (RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)) => {
                ClientError::Network(e.to_string())
            }
            other => ClientError::Api(other.to_string()),
        }
    }
}

fn classify_api_error(api: ApiError) -> ClientError {
    let text = api.to_string();
    match api {
        ApiError::TerminatedByOtherGetUpdates => ClientError::Conflict(text),
        ApiError::BotBlocked
        | ApiError::BotKicked
        | ApiError::BotKickedFromSupergroup
        | ApiError::MethodNotAvailableInPrivateChats => ClientError::PermissionDenied(text),
        _ => {
            let lowered = text.to_lowercase();
            if lowered.contains("conflict") && lowered.contains("getupdates") {
                ClientError::Conflict(text)
            } else if [
                "not enough rights",
                "administrator",
                "inaccessible",
                "forbidden",
                "kicked",
            ]
            .iter()
            .any(|needle| lowered.contains(needle))
            {
                ClientError::PermissionDenied(text)
            } else {
                ClientError::Api(text)
            }
        }
    }
}

/// Why `Supervisor::start` gave up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("supervisor already started")]
    AlreadyStarted,

    /// `stop()` already ran; a supervisor is not restartable.
    #[error("supervisor has been shut down")]
    ShutDown,

    #[error("failed to build bot client: {0}")]
    Construction(ClientError),

    #[error("failed to initialize bot: {0}")]
    Initialize(ClientError),
}

/// Why a health probe of the bot client failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("bot has not finished starting")]
    NotStarted,

    #[error("polling gave up after exhausting its retries")]
    Failed,

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Failure inside a single command handler. Never escapes the router.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("could not encode export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    MissingContext(&'static str),
}
