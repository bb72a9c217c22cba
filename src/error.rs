// Error types for the propagation engine and its collaborators

use thiserror::Error;

/// A grid locator that does not match `[A-R]{2}[0-9]{2}([a-x]{2})?`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("grid locator must be 4 or 6 characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character {found:?} at position {position}")]
    InvalidCharacter { position: usize, found: char },
}

impl LocatorError {
    /// User-facing correction text for a rejected locator.
    pub fn correction_hint(&self, input: &str) -> String {
        format!(
            "Warning: Invalid Maidenhead grid locator format: {}. Please use format like 'AB12' or 'AB12cd'.",
            input
        )
    }
}

/// Failure fetching or decoding an external propagation data feed.
#[derive(Debug, Error)]
pub enum ExternalDataError {
    #[error("feed {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("failed to read feed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode feed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Rejected change through the module settings surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingError {
    #[error("unknown setting {0:?}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_hint_mentions_input() {
        let err = LocatorError::InvalidLength(2);
        let hint = err.correction_hint("ZZ");
        assert!(hint.contains("ZZ"));
        assert!(hint.contains("'AB12cd'"));
    }

    #[test]
    fn test_display() {
        let err = LocatorError::InvalidCharacter { position: 0, found: 'Z' };
        assert_eq!(err.to_string(), "invalid character 'Z' at position 0");
    }
}
