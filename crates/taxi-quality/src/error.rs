//! Quality engine error types.

use thiserror::Error;

/// Errors raised while building or loading a rule set.
///
/// Rule evaluation itself never fails; these only surface at configuration time.
#[derive(Debug, Error)]
pub enum QualityError {
    /// A rule is malformed or the rule set breaks an ordering dependency.
    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Rule set document could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),
}

impl QualityError {
    pub(crate) fn invalid_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        QualityError::InvalidRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for QualityError {
    fn from(e: std::io::Error) -> Self {
        QualityError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for QualityError {
    fn from(e: serde_yaml::Error) -> Self {
        QualityError::Parse(e.to_string())
    }
}
