use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid mention pattern {pattern:?}: {source}")]
    InvalidMentionPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid allowlist entry: {0}")]
    InvalidAllowEntry(String),
}
