// Identifier allowlist
// Table/column names cannot be bound as parameters, so the few places that
// splice an identifier into SQL go through this check first.

use crate::errors::DatabaseError;
use crate::pattern;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    pattern::cached(&PATTERN, r"^[A-Za-z_][A-Za-z0-9_]{0,63}$")
}

/// Set of identifiers that may be interpolated into statements
#[derive(Debug, Clone, Default)]
pub struct IdentifierAllowlist {
    allowed: BTreeSet<String>,
}

impl IdentifierAllowlist {
    pub fn new<I, S>(identifiers: I) -> Result<Self, DatabaseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed = BTreeSet::new();
        for identifier in identifiers {
            let identifier = identifier.into();
            if !identifier_pattern().is_match(&identifier) {
                return Err(DatabaseError::InvalidIdentifier(identifier));
            }
            allowed.insert(identifier.to_ascii_lowercase());
        }
        Ok(Self { allowed })
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.allowed.contains(&identifier.to_ascii_lowercase())
    }

    /// Backtick-quote `identifier` if it is allowlisted
    pub fn quote(&self, identifier: &str) -> Result<String, DatabaseError> {
        if !identifier_pattern().is_match(identifier) || !self.contains(identifier) {
            return Err(DatabaseError::InvalidIdentifier(identifier.to_string()));
        }
        Ok(format!("`{}`", identifier))
    }
}
