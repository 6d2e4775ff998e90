//! Rolling per-analysis ξ history, exported with finalized candidates.

/// 600 s of history at the 500 ms base cadence.
pub const XI_HISTORY_LEN: usize = 1_200;

/// Fixed-length ring of recent ξ values. Entries arrive once per analysis
/// evaluation; snapshots return oldest-first.
#[derive(Debug, Clone)]
pub struct XiHistory {
    data: Vec<f64>,
    idx: usize,
    len: usize,
}

impl Default for XiHistory {
    fn default() -> Self {
        Self::with_capacity(XI_HISTORY_LEN)
    }
}

impl XiHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "history capacity must be nonzero");
        Self {
            data: vec![0.0; capacity],
            idx: 0,
            len: 0,
        }
    }

    pub fn push(&mut self, xi: f64) {
        self.data[self.idx] = xi;
        self.idx = (self.idx + 1) % self.data.len();
        if self.len < self.data.len() {
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The retained values, oldest first.
    pub fn snapshot(&self) -> Vec<f64> {
        let cap = self.data.len();
        let start = (self.idx + cap - self.len) % cap;
        (0..self.len)
            .map(|i| self.data[(start + i) % cap])
            .collect()
    }

    /// Most recent value, if any.
    pub fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let cap = self.data.len();
        Some(self.data[(self.idx + cap - 1) % cap])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_oldest_first() {
        let mut h = XiHistory::with_capacity(4);
        for v in 1..=3 {
            h.push(v as f64);
        }
        assert_eq!(h.snapshot(), vec![1.0, 2.0, 3.0]);
        assert_eq!(h.last(), Some(3.0));
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut h = XiHistory::with_capacity(3);
        for v in 1..=5 {
            h.push(v as f64);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.snapshot(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn empty_history() {
        let h = XiHistory::with_capacity(3);
        assert!(h.is_empty());
        assert!(h.snapshot().is_empty());
        assert_eq!(h.last(), None);
    }
}
