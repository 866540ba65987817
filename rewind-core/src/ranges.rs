use std::ops::Range;

use rangemap::RangeSet;

/// Set of downloaded byte intervals, kept canonical: disjoint, sorted by
/// start, with touching ranges merged.  Empty ranges are ignored on the way
/// in, so callers can pass degenerate requests without special-casing.
#[derive(Debug, Clone)]
pub struct ByteRanges {
    set: RangeSet<u64>,
}

impl Default for ByteRanges {
    fn default() -> Self {
        ByteRanges {
            set: RangeSet::new(),
        }
    }
}

impl ByteRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<u64>>) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(r);
        }
        set
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.start < range.end {
            self.set.insert(range);
        }
    }

    pub fn remove(&mut self, range: Range<u64>) {
        if range.start < range.end {
            self.set.remove(range);
        }
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// True iff `range` is fully covered.  Empty ranges are trivially
    /// covered.
    pub fn covers(&self, range: &Range<u64>) -> bool {
        range.start >= range.end || self.set.gaps(range).next().is_none()
    }

    /// Sub-ranges of `bound` not present in the set, in ascending order.
    pub fn missing_within(&self, bound: &Range<u64>) -> Vec<Range<u64>> {
        if bound.start >= bound.end {
            return Vec::new();
        }
        self.set.gaps(bound).collect()
    }

    /// First uncovered sub-range of `range`, if any.
    pub fn first_missing_in(&self, range: &Range<u64>) -> Option<Range<u64>> {
        if range.start >= range.end {
            return None;
        }
        self.set.gaps(range).next()
    }

    /// Start of the first covered range beginning at or after `pos`.
    pub fn next_start_at_or_after(&self, pos: u64) -> Option<u64> {
        self.set.iter().map(|r| r.start).find(|&start| start >= pos)
    }

    pub fn union(&self, other: &ByteRanges) -> ByteRanges {
        let mut out = self.clone();
        for r in other.iter() {
            out.insert(r);
        }
        out
    }

    pub fn subtract(&self, other: &ByteRanges) -> ByteRanges {
        let mut out = self.clone();
        for r in other.iter() {
            out.remove(r);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.set.iter().cloned()
    }

    pub fn to_vec(&self) -> Vec<Range<u64>> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(list: &[Range<u64>]) -> ByteRanges {
        ByteRanges::from_ranges(list.iter().cloned())
    }

    #[test]
    fn canonical_form_merges_touching_and_overlapping() {
        let set = ranges(&[0..5, 5..10]);
        assert_eq!(set.to_vec(), vec![0..10]);

        let set = ranges(&[0..6, 4..10, 20..30]);
        assert_eq!(set.to_vec(), vec![0..10, 20..30]);
    }

    #[test]
    fn empty_ranges_are_identity() {
        let mut set = ranges(&[10..20]);
        set.insert(5..5);
        set.remove(7..7);
        assert_eq!(set.to_vec(), vec![10..20]);
        assert!(set.covers(&(15..15)));
    }

    #[test]
    fn union_is_commutative_and_associative() {
        let a = ranges(&[0..10, 30..40]);
        let b = ranges(&[5..20]);
        let c = ranges(&[19..31]);

        assert_eq!(a.union(&b).to_vec(), b.union(&a).to_vec());
        assert_eq!(
            a.union(&b).union(&c).to_vec(),
            a.union(&b.union(&c)).to_vec(),
        );
        assert_eq!(a.union(&b).union(&c).to_vec(), vec![0..40]);
    }

    #[test]
    fn subtract_self_is_empty() {
        let a = ranges(&[0..10, 20..30, 40..45]);
        assert!(a.subtract(&a).is_empty());
    }

    #[test]
    fn subtract_splits_ranges() {
        let a = ranges(&[0..30]);
        let b = ranges(&[10..20]);
        assert_eq!(a.subtract(&b).to_vec(), vec![0..10, 20..30]);
    }

    #[test]
    fn covers_matches_missing() {
        let set = ranges(&[0..10, 20..30]);
        for q in [0..10, 2..8, 20..30, 5..15, 10..20, 8..22] {
            assert_eq!(set.covers(&q), set.missing_within(&q).is_empty(), "{q:?}");
        }
    }

    #[test]
    fn missing_within_reports_gaps() {
        let set = ranges(&[10..20, 30..40]);
        assert_eq!(set.missing_within(&(0..50)), vec![0..10, 20..30, 40..50]);
        assert_eq!(set.missing_within(&(12..18)), Vec::<Range<u64>>::new());
        assert_eq!(set.missing_within(&(15..35)), vec![20..30]);
    }

    #[test]
    fn gap_queries_for_the_connection_policy() {
        let set = ranges(&[0..100, 300..400]);
        assert_eq!(set.first_missing_in(&(50..350)), Some(100..300));
        assert_eq!(set.first_missing_in(&(0..100)), None);
        assert_eq!(set.next_start_at_or_after(100), Some(300));
        assert_eq!(set.next_start_at_or_after(0), Some(0));
        assert_eq!(set.next_start_at_or_after(301), None);
    }
}
