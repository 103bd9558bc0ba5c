use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid scope {0:?}: expected 1..=128 chars of [A-Za-z0-9:._*-]")]
pub struct InvalidScope(pub String);

/// Set of capability strings. Ordered so the canonical token encoding and
/// forwarded headers are stable regardless of how the scopes were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Scopes {
    allowed: BTreeSet<String>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_list<S: AsRef<str>>(items: &[S]) -> Result<Self, InvalidScope> {
        let mut s = Self::new();
        for item in items {
            let scope = item.as_ref().trim();
            if !is_valid_scope(scope) {
                return Err(InvalidScope(scope.to_string()));
            }
            s.allowed.insert(scope.to_string());
        }
        Ok(s)
    }

    /// Parse a comma separated list, skipping empty entries.
    pub fn parse_csv(raw: &str) -> Result<Self, InvalidScope> {
        let items: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        Self::parse_list(&items)
    }

    /// True when every scope in `required` is granted here.
    pub fn covers(&self, required: &Scopes) -> bool {
        required.allowed.is_subset(&self.allowed)
    }

    /// First required scope that is not granted, for diagnostics.
    pub fn first_missing<'a>(&self, required: &'a Scopes) -> Option<&'a str> {
        required
            .allowed
            .iter()
            .find(|s| !self.allowed.contains(*s))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Comma joined, sorted. Scope syntax excludes ',' so this is reversible.
    pub fn to_csv(&self) -> String {
        self.iter().collect::<Vec<_>>().join(",")
    }
}

fn is_valid_scope(scope: &str) -> bool {
    !scope.is_empty()
        && scope.len() <= 128
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '*' | '-'))
}

impl TryFrom<Vec<String>> for Scopes {
    type Error = InvalidScope;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::parse_list(&value)
    }
}

impl From<Scopes> for Vec<String> {
    fn from(value: Scopes) -> Self {
        value.allowed.into_iter().collect()
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv())
    }
}
