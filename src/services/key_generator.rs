//! Storage key generation: `<nanosecond timestamp>_<sanitized name>`.

use crate::models::ObjectKey;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const MAX_NAME_CHARS: usize = 255;
const FALLBACK_NAME: &str = "unnamed";

/// Produces keys that never repeat within one generator.
///
/// The timestamp component is wall-clock nanoseconds, bumped by one whenever
/// the clock has not advanced past the last issued value, so keys stay
/// unique (and ordered) even for calls in the same nanosecond or across a
/// clock step backwards.
#[derive(Debug, Default)]
pub struct KeyGenerator {
    last_timestamp: AtomicU64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self, logical_name: &str) -> ObjectKey {
        let timestamp = self.next_timestamp();
        ObjectKey::new(format!("{}_{}", timestamp, sanitize_name(logical_name)))
    }

    fn next_timestamp(&self) -> u64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or_default();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }
}

/// Reduce a caller-supplied name to something safe to embed in a key.
///
/// Keeps only the last path segment (either separator), drops control
/// characters (NUL included) and characters object stores or filesystems
/// reject, and strips leading dots so `..` cannot survive.
pub fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !ILLEGAL_CHARS.contains(c))
        .take(MAX_NAME_CHARS)
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.').trim_start();
    if trimmed.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc};

    #[test]
    fn key_is_timestamp_then_name() {
        let key = KeyGenerator::new().generate("report.pdf");
        let (timestamp, name) = key.as_str().split_once('_').unwrap();
        assert!(!timestamp.is_empty());
        assert!(timestamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(name, "report.pdf");
    }

    #[test]
    fn same_name_never_collides() {
        let generator = KeyGenerator::new();
        let keys: HashSet<ObjectKey> = (0..10_000).map(|_| generator.generate("a.txt")).collect();
        assert_eq!(keys.len(), 10_000);
    }

    #[test]
    fn keys_stay_unique_across_threads() {
        let generator = Arc::new(KeyGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| generator.generate("same.bin"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(all.insert(key));
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let generator = KeyGenerator::new();
        let first = generator.next_timestamp();
        let second = generator.next_timestamp();
        assert!(second > first);
    }

    #[test]
    fn sanitizing_strips_paths_and_illegal_characters() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_name("we<ird>|na\0me?.txt"), "weirdname.txt");
        assert_eq!(sanitize_name(".hidden"), "hidden");
        assert_eq!(sanitize_name(".."), FALLBACK_NAME);
        assert_eq!(sanitize_name("dir/"), FALLBACK_NAME);
        assert_eq!(sanitize_name("spaced name.doc"), "spaced name.doc");
    }
}
