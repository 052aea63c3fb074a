//! Skill store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Invalid skill name '{0}'")]
    InvalidName(String),

    #[error("Invalid skill document: {0}")]
    InvalidDocument(String),

    #[error("Skill validation failed: {0}")]
    Validation(String),

    #[error("File too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
