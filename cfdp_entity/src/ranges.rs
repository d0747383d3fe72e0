//! Ordered set of disjoint, auto-merging byte ranges `[start, end)`.
//!
//! Receivers record every FileData segment here; gaps are whatever the set
//! does not cover below a given bound. Touching or overlapping inserts are
//! merged, so the map never holds two adjacent entries.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `[start, end)` and returns how many bytes were not covered before.
    pub fn insert(&mut self, start: u64, end: u64) -> u64 {
        if start >= end {
            return 0;
        }
        let mut merged_start = start;
        let mut merged_end = end;
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                merged_start = s;
                merged_end = merged_end.max(e);
            }
        }

        let absorbed: Vec<(u64, u64)> = self
            .ranges
            .range(merged_start..=merged_end)
            .map(|(&s, &e)| (s, e))
            .collect();
        let mut already = 0;
        for (s, e) in absorbed {
            already += e.min(end).saturating_sub(s.max(start));
            merged_end = merged_end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(merged_start, merged_end);
        (end - start) - already
    }

    /// True when `[start, end)` is fully covered. Empty ranges always are.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(_, &e)| e >= end)
    }

    /// True when `[0, len)` is fully covered.
    pub fn covers(&self, len: u64) -> bool {
        self.contains(0, len)
    }

    /// Uncovered ranges inside `[0, upto)`, ascending.
    pub fn gaps(&self, upto: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for (&s, &e) in &self.ranges {
            if s >= upto {
                break;
            }
            if s > cursor {
                gaps.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < upto {
            gaps.push((cursor, upto));
        }
        gaps
    }

    /// Length of the run starting at offset 0.
    pub fn contiguous_prefix(&self) -> u64 {
        self.ranges.get(&0).copied().unwrap_or(0)
    }

    /// Total bytes covered.
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// End of the highest range, 0 when empty.
    pub fn highest_end(&self) -> u64 {
        self.ranges.values().next_back().copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        assert_eq!(set.insert(0, 4), 4);
        assert_eq!(set.insert(8, 10), 2);
        assert_eq!(set.len(), 2);

        // touching on the left edge merges without counting new bytes twice
        assert_eq!(set.insert(4, 6), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 6), (8, 10)]);

        // bridge the hole, overlapping both neighbours
        assert_eq!(set.insert(5, 9), 2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 10)]);
        assert!(set.covers(10));
    }

    #[test]
    fn duplicate_insert_adds_nothing() {
        let mut set = RangeSet::new();
        set.insert(4, 8);
        assert_eq!(set.insert(4, 8), 0);
        assert_eq!(set.insert(5, 7), 0);
        assert_eq!(set.insert(8, 8), 0);
        assert_eq!(set.total(), 4);
    }

    #[test]
    fn swallowing_insert() {
        let mut set = RangeSet::new();
        set.insert(2, 3);
        set.insert(5, 6);
        set.insert(8, 9);
        assert_eq!(set.insert(0, 12), 9);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0, 12)]);
    }

    #[test]
    fn gaps_below_bound() {
        let mut set = RangeSet::new();
        set.insert(0, 4);
        set.insert(8, 10);
        assert_eq!(set.gaps(10), vec![(4, 8)]);
        assert_eq!(set.gaps(14), vec![(4, 8), (10, 14)]);
        assert_eq!(set.gaps(6), vec![(4, 6)]);
        assert_eq!(RangeSet::new().gaps(5), vec![(0, 5)]);
        assert!(RangeSet::new().gaps(0).is_empty());
    }

    #[test]
    fn prefix_and_highest() {
        let mut set = RangeSet::new();
        assert_eq!(set.contiguous_prefix(), 0);
        set.insert(4, 8);
        assert_eq!(set.contiguous_prefix(), 0);
        assert_eq!(set.highest_end(), 8);
        set.insert(0, 4);
        assert_eq!(set.contiguous_prefix(), 8);
        assert!(set.contains(2, 7));
        assert!(!set.contains(2, 9));
    }

    proptest! {
        #[test]
        fn gaps_and_ranges_partition(inserts in proptest::collection::vec((0u64..200, 0u64..40), 0..40)) {
            let mut set = RangeSet::new();
            let mut bitmap = vec![false; 240];
            for (start, len) in inserts {
                let end = start + len;
                let fresh = bitmap[start as usize..end as usize].iter().filter(|b| !**b).count() as u64;
                prop_assert_eq!(set.insert(start, end), fresh);
                bitmap[start as usize..end as usize].iter_mut().for_each(|b| *b = true);
            }

            let covered = bitmap.iter().filter(|b| **b).count() as u64;
            prop_assert_eq!(set.total(), covered);

            let gap_bytes: u64 = set.gaps(240).iter().map(|(s, e)| e - s).sum();
            prop_assert_eq!(gap_bytes + covered, 240);
            for (s, e) in set.gaps(240) {
                prop_assert!(bitmap[s as usize..e as usize].iter().all(|b| !*b));
            }

            // stored ranges never touch each other
            let ranges: Vec<_> = set.iter().collect();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 < pair[1].0);
            }
        }
    }
}
