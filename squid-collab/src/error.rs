//! Client-visible error taxonomy for board operations.
//!
//! `OrderOutOfRange`, `NotFound`, `Unauthorized` and `BadRequest` surface as
//! 4xx outcomes. `StoreFailure` surfaces as a generic 500; its detail is only
//! logged. Per-connection delivery failures never reach this type, see
//! [`crate::registry::TransportError`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::model::ScopeRef;
use crate::storage::StoreError;

/// Kinds of entity a lookup can miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Project,
    Column,
    Row,
    Label,
    CommentSection,
    Comment,
    Checklist,
    Point,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Project => "project",
            Entity::Column => "column",
            Entity::Row => "row",
            Entity::Label => "label",
            Entity::CommentSection => "comment section",
            Entity::Comment => "comment",
            Entity::Checklist => "checklist",
            Entity::Point => "point",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("order {requested} is out of range 1..={max} for {scope}")]
    OrderOutOfRange {
        scope: ScopeRef,
        requested: i64,
        max: i64,
    },

    #[error("{entity} with id {id} not found")]
    NotFound { entity: Entity, id: Uuid },

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("store failure: {0}")]
    StoreFailure(#[from] StoreError),

    #[error("request exceeded its {0:?} deadline")]
    Timeout(Duration),
}

pub type BoardResult<T> = Result<T, BoardError>;

/// JSON body handed back to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: &'static str,
    pub status: u16,
}

impl BoardError {
    pub fn not_found(entity: Entity, id: Uuid) -> Self {
        BoardError::NotFound { entity, id }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        BoardError::BadRequest(message.into())
    }

    /// HTTP status for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            BoardError::OrderOutOfRange { .. } | BoardError::BadRequest(_) => 400,
            BoardError::Unauthorized(_) => 401,
            BoardError::NotFound { .. } => 404,
            BoardError::Timeout(_) => 504,
            BoardError::StoreFailure(_) => 500,
        }
    }

    /// Message safe to show to clients.
    pub fn public_message(&self) -> String {
        match self {
            BoardError::StoreFailure(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Build the response body, logging internal detail that is withheld from it.
    pub fn to_response(&self) -> ErrorResponse {
        let message = match self {
            BoardError::OrderOutOfRange { .. } | BoardError::BadRequest(_) => "bad request",
            BoardError::Unauthorized(_) => "unauthorized",
            BoardError::NotFound { .. } => "not found",
            BoardError::Timeout(_) => "timeout",
            BoardError::StoreFailure(e) => {
                log::error!("Store failure while handling request: {e}");
                "internal server error"
            }
        };
        ErrorResponse {
            error: self.public_message(),
            message,
            status: self.status_code(),
        }
    }
}
