use ahash::AHashMap;

/// Frequency count over identifiers that remembers first-seen order, so the
/// mode is deterministic: among equal counts the earliest value wins.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tally {
    index: AHashMap<String, usize>,
    counts: Vec<(String, usize)>,
}

impl Tally {
    pub(crate) fn seeded(value: &str) -> Self {
        let mut tally = Self::default();
        tally.push(value);
        tally
    }

    pub(crate) fn push(&mut self, value: &str) {
        match self.index.get(value) {
            Some(&slot) => self.counts[slot].1 += 1,
            None => {
                self.index.insert(value.to_string(), self.counts.len());
                self.counts.push((value.to_string(), 1));
            }
        }
    }

    /// Number of distinct values seen.
    pub(crate) fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub(crate) fn mode(&self) -> Option<&str> {
        let mut best: Option<&(String, usize)> = None;
        for entry in &self.counts {
            if best.is_none_or(|current| entry.1 > current.1) {
                best = Some(entry);
            }
        }
        best.map(|(value, _)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_prefers_highest_count() {
        let mut tally = Tally::seeded("a");
        tally.push("b");
        tally.push("b");
        assert_eq!(tally.mode(), Some("b"));
        assert_eq!(tally.distinct(), 2);
    }

    #[test]
    fn ties_resolve_to_first_seen() {
        let mut tally = Tally::seeded("z");
        tally.push("a");
        tally.push("a");
        tally.push("z");
        assert_eq!(tally.mode(), Some("z"));
    }

    #[test]
    fn empty_tally_has_no_mode() {
        assert_eq!(Tally::default().mode(), None);
    }
}
