use thiserror::Error;
use ulid::Ulid;

/// Coarse error class handed to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    State,
    NotFound,
    Forbidden,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Space,
    Window,
    Maintenance,
    Reservation,
    Item,
    Link,
    Notification,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Entity::Space => "space",
            Entity::Window => "operating window",
            Entity::Maintenance => "maintenance block",
            Entity::Reservation => "reservation",
            Entity::Item => "equipment item",
            Entity::Link => "loan",
            Entity::Notification => "notification",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: bad time range, bad notice, empty field.
    #[error("{0}")]
    Validation(String),
    /// The request is well-formed but collides with existing state or a business limit.
    #[error("{0}")]
    Conflict(String),
    #[error("{entity} is {current}, cannot become {attempted}")]
    State {
        entity: Entity,
        current: String,
        attempted: String,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: Ulid },
    #[error("not allowed: {0}")]
    Forbidden(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage failure: {0}")]
    Persistence(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::State { .. } => ErrorKind::State,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    pub(crate) fn not_found(entity: Entity, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub(crate) fn state(entity: Entity, current: impl ToString, attempted: impl ToString) -> Self {
        EngineError::State {
            entity,
            current: current.to_string(),
            attempted: attempted.to_string(),
        }
    }

    /// Label for the rejection metric.
    pub(crate) fn metric_label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::State => "state",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Persistence => "persistence",
        }
    }
}
