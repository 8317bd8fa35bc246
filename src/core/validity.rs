//! Point validity tracking.
//!
//! Every read or write against the wire leaves a mark on the point: a
//! fresh value, a stale value, or nothing yet. Client-mode table views
//! use the flag to blank stale rows instead of presenting dead numbers.

use serde::{Deserialize, Serialize};

/// Tri-state validity of a point value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    /// No read or write has been attempted yet
    #[default]
    Unknown,

    /// The last protocol operation on this point succeeded
    Fresh,

    /// The last protocol operation on this point failed
    Stale,
}

impl Validity {
    /// Check if the value reflects a successful exchange.
    #[inline]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }

    /// Check if the value is known to be stale.
    #[inline]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }

    /// Get a short description of this state.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Fresh => "Fresh",
            Self::Stale => "Stale",
        }
    }
}

impl std::fmt::Display for Validity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_default() {
        assert_eq!(Validity::default(), Validity::Unknown);
    }

    #[test]
    fn test_validity_checks() {
        assert!(Validity::Fresh.is_fresh());
        assert!(!Validity::Unknown.is_fresh());
        assert!(Validity::Stale.is_stale());
        assert!(!Validity::Unknown.is_stale());
    }
}
