//! Compiled-pattern cache shared by filter evaluations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use regex::Regex;

#[derive(Clone, Debug)]
enum Entry {
    Compiled(Regex),
    /// The pattern does not compile; it never matches anything.
    Failed(regex::Error),
}

/// Lazily compiles regex patterns, at most once per pattern string.
///
/// Lookups take a shared lock. A miss takes the write lock and compiles
/// while holding it, so two evaluators racing on the same new pattern still
/// produce a single compilation. Failures are remembered too.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: RwLock<HashMap<String, Entry>>,
    compilations: AtomicUsize,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled pattern, compiling it on first use.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Regex, regex::Error> {
        if let Some(entry) = self.entries.read().get(pattern) {
            return entry.clone().into_result();
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(pattern.to_string()).or_insert_with(|| {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            match Regex::new(pattern) {
                Ok(re) => Entry::Compiled(re),
                Err(e) => {
                    tracing::debug!(pattern, error = %e, "pattern failed to compile");
                    Entry::Failed(e)
                }
            }
        });

        entry.clone().into_result()
    }

    /// Whether `text` matches `pattern`. A pattern that fails to compile
    /// matches nothing.
    pub fn is_match(&self, pattern: &str, text: &str) -> bool {
        self.get_or_compile(pattern)
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    }

    /// Number of times the regex compiler has been invoked.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Entry {
    fn into_result(self) -> Result<Regex, regex::Error> {
        match self {
            Entry::Compiled(re) => Ok(re),
            Entry::Failed(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PatternCache;
    use std::sync::Arc;

    #[test]
    fn test_compiles_once() {
        let cache = PatternCache::new();

        assert!(cache.is_match("fo+", "foooo"));
        assert!(!cache.is_match("fo+", "bar"));
        assert!(cache.get_or_compile("fo+").is_ok());

        assert_eq!(cache.compilations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failure_is_remembered() {
        let cache = PatternCache::new();

        assert!(cache.get_or_compile("(unclosed").is_err());
        assert!(!cache.is_match("(unclosed", "(unclosed"));
        assert!(cache.get_or_compile("(unclosed").is_err());

        assert_eq!(cache.compilations(), 1);
    }

    #[test]
    fn test_concurrent_lookups() {
        let cache = Arc::new(PatternCache::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(cache.is_match("^line [0-9]+$", &format!("line {}", i)));
                        assert!(!cache.is_match("[", "["));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.compilations(), 2);
    }
}
