// Lazily compiled regular expressions shared across the crate

use regex::Regex;
use std::sync::OnceLock;

/// Compile `source` into `cell` on first use
pub(crate) fn cached(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("Invalid regex pattern"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_compiled_once() {
        static CELL: OnceLock<Regex> = OnceLock::new();
        let first = cached(&CELL, r"^\d+$");
        let second = cached(&CELL, r"ignored once compiled");
        assert!(std::ptr::eq(first, second));
        assert!(second.is_match("42"));
    }
}
