use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid autonomy mode: {0} (expected collaborative or autonomous)")]
    InvalidMode(String),

    #[error("invalid risk level: {0} (expected low, medium or high)")]
    InvalidRisk(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("failed to persist policy settings: {0}")]
    Persist(String),

    #[error("settings store error: {0}")]
    Settings(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PolicyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
