//! Error types for the dispatch gateway
//!
//! Every layer has its own `thiserror` enum; [`GatewayError`] gathers them and
//! maps each to the wire taxonomy ([`ErrorKind`]) with an actionable `details`
//! payload. Messages are sanitized before they leave the process.

use crate::config::ConfigError;
use crate::health::{HealthRecord, HealthStatus};
use crate::protocol::{ErrorBody, ErrorKind};
use crate::registry::RegistryError;
use crate::routing::RoutingError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Why a single backend attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    AgentUnreachable,
    AgentUnhealthy,
    UpstreamTimeout,
    UpstreamError,
    InvalidRequest,
    RoutingError,
}

impl FailureKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            FailureKind::AgentUnreachable => ErrorKind::AgentUnreachable,
            FailureKind::AgentUnhealthy => ErrorKind::AgentUnhealthy,
            FailureKind::UpstreamTimeout => ErrorKind::UpstreamTimeout,
            FailureKind::UpstreamError => ErrorKind::UpstreamError,
            FailureKind::InvalidRequest => ErrorKind::InvalidRequest,
            FailureKind::RoutingError => ErrorKind::RoutingError,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error_kind(), f)
    }
}

/// Failure of one attempt against one backend
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{kind} from backend '{backend_key}': {message}")]
pub struct DispatchFailure {
    pub backend_key: String,
    pub kind: FailureKind,
    pub message: String,
    /// The backend itself produced the failure (as opposed to the caller's input
    /// or the gateway)
    pub backend_caused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Transport attempts made, including an idempotent retry
    pub attempts: u32,
}

impl DispatchFailure {
    fn new(
        backend_key: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        backend_caused: bool,
    ) -> Self {
        Self {
            backend_key: backend_key.into(),
            kind,
            message: message.into(),
            backend_caused,
            status: None,
            attempts: 1,
        }
    }

    /// Backend could not be connected to
    pub fn unreachable<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::AgentUnreachable, message, true)
    }

    /// Backend answered its health probe as not fit for traffic
    pub fn unhealthy<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::AgentUnhealthy, message, true)
    }

    /// Attempt ran past its timeout or the request deadline
    pub fn timeout<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::UpstreamTimeout, message, true)
    }

    /// Backend answered with an error of its own
    pub fn upstream<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::UpstreamError, message, true)
    }

    /// Upstream failure not attributable to the backend (request construction,
    /// gateway-side decoding)
    pub fn gateway_fault<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::UpstreamError, message, false)
    }

    /// Backend rejected the caller's input
    pub fn caller_error<K: Into<String>, S: Into<String>>(backend_key: K, message: S) -> Self {
        Self::new(backend_key, FailureKind::InvalidRequest, message, false)
    }

    /// Target could not be resolved against the registry
    pub fn routing(error: &RoutingError) -> Self {
        let key = error
            .unresolved_key
            .clone()
            .unwrap_or_else(|| error.task_type.clone());
        Self::new(key, FailureKind::RoutingError, error.to_string(), false)
    }

    /// Health gate rejection for a non-routable record
    pub fn from_health(record: &HealthRecord) -> Self {
        let detail = record
            .detail
            .clone()
            .unwrap_or_else(|| format!("{:?}", record.status));
        match record.status {
            HealthStatus::Unhealthy => Self::unhealthy(
                &record.backend_key,
                format!("health gate: backend is unhealthy ({detail})"),
            ),
            _ => Self::unreachable(
                &record.backend_key,
                format!("health gate: backend is unreachable ({detail})"),
            ),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether this failure may be retried on the route's fallback backend
    pub fn is_fallback_eligible(&self) -> bool {
        match self.kind {
            FailureKind::AgentUnreachable
            | FailureKind::AgentUnhealthy
            | FailureKind::UpstreamTimeout => true,
            FailureKind::UpstreamError => self.backend_caused,
            FailureKind::InvalidRequest | FailureKind::RoutingError => false,
        }
    }

    /// Sanitized detail object for error bodies
    pub fn details(&self) -> Value {
        let mut details = json!({
            "backend_key": self.backend_key,
            "kind": self.kind,
            "message": sanitize_error_message(&self.message),
            "backend_caused": self.backend_caused,
            "attempts": self.attempts,
        });
        if let Some(status) = self.status {
            details["status"] = json!(status);
        }
        details
    }
}

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    #[error(
        "primary '{}' failed with {} and fallback '{}' failed with {}",
        .primary.backend_key, .primary.kind, .fallback.backend_key, .fallback.kind
    )]
    FallbackExhausted {
        primary: DispatchFailure,
        fallback: DispatchFailure,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn fallback_exhausted(primary: DispatchFailure, fallback: DispatchFailure) -> Self {
        Self::FallbackExhausted { primary, fallback }
    }

    /// Wire taxonomy entry for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Registry(_) => ErrorKind::RegistryError,
            GatewayError::Routing(_) => ErrorKind::RoutingError,
            GatewayError::Dispatch(failure) => failure.kind.error_kind(),
            GatewayError::FallbackExhausted { .. } => ErrorKind::FallbackExhausted,
            GatewayError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            GatewayError::Config(_) | GatewayError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Convert to the structured error carried by a failed result
    pub fn to_error_body(&self) -> ErrorBody {
        let details = match self {
            GatewayError::Registry(e) => json!({ "issues": e.issues }),
            GatewayError::Routing(e) => serde_json::to_value(e).unwrap_or(Value::Null),
            GatewayError::Dispatch(failure) => json!({
                "failed_path": "primary",
                "cause": failure.details(),
            }),
            GatewayError::FallbackExhausted { primary, fallback } => json!({
                "primary": primary.details(),
                "fallback": fallback.details(),
            }),
            GatewayError::InvalidRequest { .. }
            | GatewayError::Config(_)
            | GatewayError::Internal { .. } => Value::Null,
        };

        ErrorBody {
            kind: self.kind(),
            message: sanitize_error_message(&self.to_string()),
            details,
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").expect("bearer pattern is valid"));

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Strip credentials and credential paths from a message, then cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let sanitized = BEARER_PATTERN.replace_all(&sanitized, "Bearer ***");

    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
