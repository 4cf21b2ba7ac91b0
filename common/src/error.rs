//! Errores del dominio: store compartido, artefactos, etapas y configuración.

use crate::task::StageKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Falla de comunicación con el store compartido (red, lock, respuesta rara).
    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Comando de hash sobre un string o al revés (o DECR sobre algo no numérico).
    #[error("wrong type for key {key}")]
    WrongType { key: String },

    /// DECR que se saldría del rango de i64.
    #[error("value out of range for key {key}")]
    OutOfRange { key: String },

    /// El nombre del archivo no sigue la convención <fov>_<marker>_<time>.
    #[error("malformed artifact name {path}: {reason}")]
    MalformedName { path: String, reason: String },

    /// La clave no tiene la forma masks:{run_id}:{fov_id}.
    #[error("malformed key {key}")]
    MalformedKey { key: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid settings: {message}")]
    Config { message: String },

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// Se acabaron los labels representables en u32.
    #[error("label overflow: cannot allocate {requested} labels after {running_max}")]
    LabelOverflow { running_max: u32, requested: usize },

    #[error("image error in {path}: {message}")]
    Image { path: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segmentation failed: {message}")]
    Segmentation { message: String },

    #[error("dispatch failed: {message}")]
    Dispatch { message: String },

    #[error("no handler registered for stage {0}")]
    UnknownStage(StageKind),

    #[error("stage {stage} received unexpected input: {message}")]
    UnexpectedInput { stage: StageKind, message: String },

    /// Panic o cancelación dentro de un spawn_blocking.
    #[error("blocking section failed: {0}")]
    Blocking(String),
}

impl Error {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn malformed_name(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedName {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn image(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Image {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// true para errores transitorios de comunicación con el store,
    /// los que la cola debería reintentar.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Dispatch { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Blocking(e.to_string())
    }
}
