//! Error types for the console

use std::fmt;

use thiserror::Error;

/// One failed field check, reported before anything reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport failure talking to the backend
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with an error status
    #[error("{method} {path} returned {status}: {body}")]
    Backend {
        method: &'static str,
        path: String,
        status: u16,
        body: String,
    },

    #[error("validation error: {0}")]
    Validation(ValidationErrors),

    /// A backend operation is in flight on the node
    #[error("node {0} is locked")]
    NodeLocked(String),

    /// The cluster is not in a state that accepts changes
    #[error("cluster busy: {0}")]
    ClusterBusy(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no cluster topology loaded")]
    NoTopology,

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::default();
        errors.push(field, message);
        Self::Validation(errors)
    }

    pub fn node_locked(name: impl Into<String>) -> Self {
        Self::NodeLocked(name.into())
    }

    pub fn cluster_busy(msg: impl Into<String>) -> Self {
        Self::ClusterBusy(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
