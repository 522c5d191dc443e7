//! Sources already fetched during one discovery run.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use log::debug;

/// Remembers which sources (hosts, files) have been fetched so that an
/// orchestrator following references between devices visits each only once.
///
/// Owned by the orchestrator and passed to whoever needs it; safe to share
/// between tasks.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Mutex<HashSet<String>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the source was already present.
    pub fn add(&self, source: impl Into<String>) -> bool {
        let source = source.into();
        debug!("Registering fetched source {source}");
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(source)
    }

    pub fn len(&self) -> usize {
        self.sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut sources: Vec<String> = self
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        sources.sort();
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn each_source_is_added_once() {
        let registry = SourceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.add("ne1.example.net"));
        assert!(!registry.add("ne1.example.net"));
        assert!(registry.add("dump.bin"));
        assert!(registry.contains("dump.bin"));
        assert!(!registry.contains("ne2.example.net"));
        assert_eq!(registry.sources(), ["dump.bin", "ne1.example.net"]);
    }

    #[test]
    fn shared_between_threads() {
        let registry = Arc::new(SourceRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.add(format!("host{}", n % 2)))
            })
            .collect();
        let added = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .filter(|added| *added)
            .count();
        assert_eq!(added, 2);
        assert_eq!(registry.len(), 2);
    }
}
