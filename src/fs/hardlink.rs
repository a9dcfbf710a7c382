use std::collections::HashMap;

/// tracker for detecting hardlinks while building a layer
///
/// regular files sharing a (dev, ino) pair are the same inode. the first
/// path written to the archive carries the content; later paths become
/// hardlink records pointing at it.
#[derive(Debug, Default)]
pub struct HardlinkTracker {
    /// maps (dev, ino) to the first archive path that referenced it
    seen: HashMap<(u64, u64), String>,
}

impl HardlinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the earlier archive path for this inode, or records `path`
    /// as the first occurrence and returns None
    pub fn check(&mut self, dev: u64, ino: u64, path: &str) -> Option<String> {
        if let Some(existing) = self.seen.get(&(dev, ino)) {
            return Some(existing.clone());
        }
        self.seen.insert((dev, ino), path.to_string());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_is_recorded() {
        let mut tracker = HardlinkTracker::new();
        assert!(tracker.check(1, 12345, "usr/bin/a").is_none());
        assert!(tracker.check(1, 54321, "usr/bin/z").is_none());
    }

    #[test]
    fn test_second_occurrence_links_to_first() {
        let mut tracker = HardlinkTracker::new();
        tracker.check(1, 12345, "usr/bin/a");
        assert_eq!(
            tracker.check(1, 12345, "usr/bin/b"),
            Some("usr/bin/a".to_string())
        );
        // still the first path on a third sighting
        assert_eq!(
            tracker.check(1, 12345, "usr/bin/c"),
            Some("usr/bin/a".to_string())
        );
    }

    #[test]
    fn test_same_ino_different_dev() {
        let mut tracker = HardlinkTracker::new();
        tracker.check(1, 12345, "a");
        assert!(tracker.check(2, 12345, "b").is_none());
        assert_eq!(tracker.check(2, 12345, "c"), Some("b".to_string()));
    }
}
