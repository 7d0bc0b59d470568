//! Pre-transfer acceptance checks.
//!
//! [`ValidationGate`] is the stock [`Scanner`]: it looks at the logical name
//! and the declared size only. Deployments that scan content can provide
//! their own `Scanner` and hand it to the coordinator instead.

use crate::models::ValidationVerdict;
use async_trait::async_trait;

/// Reason reported for zero-byte uploads, whether declared or observed.
pub const EMPTY_FILE_REASON: &str = "empty files are not allowed";

/// What the gate gets to see of an upload before any byte is transferred.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub logical_name: &'a str,
    pub declared_size: Option<u64>,
}

impl<'a> Candidate<'a> {
    pub fn new(logical_name: &'a str, declared_size: Option<u64>) -> Self {
        Self {
            logical_name,
            declared_size,
        }
    }
}

/// Decides whether an upload may proceed.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, candidate: &Candidate<'_>) -> ValidationVerdict;
}

/// Name and size checks, applied in order, first failure wins:
///
/// 1. the name must not be empty or unreadable;
/// 2. the name must not match a denylist pattern;
/// 3. a declared size must not be zero.
///
/// Patterns starting with `.` match as a file extension, any other pattern
/// as a substring. Matching ignores case.
#[derive(Debug, Clone)]
pub struct ValidationGate {
    denylist: Vec<String>,
}

impl ValidationGate {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denylist = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { denylist }
    }

    pub fn validate(&self, candidate: &Candidate<'_>) -> ValidationVerdict {
        let name = candidate.logical_name;
        if !is_readable(name) {
            return ValidationVerdict::reject("file name is empty or unreadable");
        }

        let lowered = name.to_lowercase();
        for pattern in &self.denylist {
            if pattern.starts_with('.') {
                if lowered.ends_with(pattern.as_str()) {
                    return ValidationVerdict::reject(format!(
                        "file type `{}` is not allowed: {}",
                        pattern, name
                    ));
                }
            } else if lowered.contains(pattern.as_str()) {
                return ValidationVerdict::reject(format!(
                    "malicious file detected: {} matches denylist pattern `{}`",
                    name, pattern
                ));
            }
        }

        if candidate.declared_size == Some(0) {
            return ValidationVerdict::reject(EMPTY_FILE_REASON);
        }

        ValidationVerdict::accept()
    }
}

#[async_trait]
impl Scanner for ValidationGate {
    async fn scan(&self, candidate: &Candidate<'_>) -> ValidationVerdict {
        self.validate(candidate)
    }
}

/// Non-blank, no control characters, and no replacement characters left
/// behind by a lossy decode.
fn is_readable(name: &str) -> bool {
    !name.trim().is_empty() && !name.chars().any(|c| c.is_control() || c == '\u{FFFD}')
}
