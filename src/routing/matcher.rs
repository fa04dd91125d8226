//! Prefix matching and URI rewriting.
//!
//! # Responsibilities
//! - Match a request URI against a service prefix
//! - Rewrite the URI for the matched service (strip or replace the prefix)
//! - Derive `SCRIPT_NAME` for the application
//!
//! # Design Decisions
//! - Matching is a plain, case-sensitive string prefix test, not path-segment
//!   aware: prefix `/ab` matches `/abc`
//! - The query string is part of the URI and is carried through rewriting
//! - No regex to guarantee O(n) matching

/// A service's prefix rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRule {
    prefix: String,
    replacement: Option<String>,
}

impl PrefixRule {
    pub fn new(prefix: impl Into<String>, replacement: Option<String>) -> Self {
        Self {
            prefix: prefix.into(),
            replacement,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn replacement(&self) -> Option<&str> {
        self.replacement.as_deref()
    }

    /// Returns true if `uri` starts with the prefix.
    pub fn matches(&self, uri: &str) -> bool {
        uri.starts_with(&self.prefix)
    }

    /// Rewrite a matching `uri`: drop the prefix, make sure what is left
    /// starts with `/`, then put the replacement in front of it.
    ///
    /// Returns `None` if the URI does not match.
    pub fn rewrite(&self, uri: &str) -> Option<String> {
        let rest = uri.strip_prefix(self.prefix.as_str())?;
        let mut out = String::with_capacity(uri.len() + 8);
        if let Some(replacement) = &self.replacement {
            out.push_str(replacement);
        }
        if !rest.starts_with('/') {
            out.push('/');
        }
        out.push_str(rest);
        Some(out)
    }

    /// Matched prefix without trailing slashes (`SCRIPT_NAME`). Empty for `/`.
    pub fn script_name(&self) -> &str {
        self.prefix.trim_end_matches('/')
    }
}
