//! Append-only diagnostics trail threaded through a reconciliation.

use std::collections::VecDeque;

use tracing::debug;

/// Default number of entries kept when no cap is configured.
pub const DEFAULT_CAP: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    entries: VecDeque<String>,
    cap: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_cap(DEFAULT_CAP)
    }
}

impl Diagnostics {
    pub fn with_cap(cap: usize) -> Self {
        Self { entries: VecDeque::new(), cap: cap.max(1) }
    }

    /// Rehydrate a trail carried over from a previous step; oldest entries beyond the cap are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = String>, cap: usize) -> Self {
        let mut d = Self::with_cap(cap);
        for e in entries {
            d.push(e);
        }
        d
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        let entry = entry.into();
        debug!(entry = %entry, "diagnostics: push");
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.as_str())
    }

    /// Entries joined the way failure messages print them.
    pub fn joined(&self) -> String {
        self.entries.iter().cloned().collect::<Vec<_>>().join("\n ")
    }

    pub fn into_vec(self) -> Vec<String> {
        self.entries.into_iter().collect()
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = String>) {
        for e in other {
            self.push(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_entries() {
        let mut d = Diagnostics::with_cap(2);
        d.push("a");
        d.push("b");
        d.push("c");
        assert_eq!(d.into_vec(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn joined_uses_line_separator() {
        let d = Diagnostics::from_entries(vec!["pending: svc/web".to_string(), "release: pending-install".to_string()], 5);
        assert_eq!(d.joined(), "pending: svc/web\n release: pending-install");
        assert_eq!(d.len(), 2);
    }
}
