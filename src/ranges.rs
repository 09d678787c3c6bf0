use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::{anyhow, bail};

use crate::wsrm::elements::AckRange;


/// A set of message numbers, stored as disjoint closed intervals `[lower, upper]`. Intervals are
///  kept sorted, non-overlapping and non-adjacent: whenever two intervals touch, they are merged,
///  so there is exactly one representation for any given set of numbers.
///
/// This is what both sides of a sequence track - the sender the numbers acknowledged by the
///  peer, the receiver the numbers it has received.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct AckRangeSet {
    /// lower bound -> upper bound (both inclusive)
    ranges: BTreeMap<u64, u64>,
}

impl AckRangeSet {
    pub fn new() -> AckRangeSet {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, number: u64) -> bool {
        self.ranges.range(..=number)
            .next_back()
            .map(|(_, &upper)| upper >= number)
            .unwrap_or(false)
    }

    /// the highest number in the set
    pub fn highest(&self) -> Option<u64> {
        self.ranges.values().next_back().cloned()
    }

    /// true iff every number in `1..=n` is in the set. Trivially true for n == 0.
    pub fn complete_up_to(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        match self.ranges.get(&1) {
            Some(&upper) => upper >= n,
            None => false,
        }
    }

    /// the highest `n` for which [AckRangeSet::complete_up_to] holds
    pub fn contiguous_upper_bound(&self) -> u64 {
        self.ranges.get(&1).cloned().unwrap_or(0)
    }

    pub fn insert(&mut self, number: u64) -> bool {
        !self.insert_range(number, number).is_empty()
    }

    /// Adds all numbers in `[lower, upper]` to the set. Adding numbers that are already present
    ///  is a no-op, so this is idempotent.
    ///
    /// Returns the sub-ranges that were not covered before, i.e. the numbers that are new to the set.
    pub fn insert_range(&mut self, lower: u64, upper: u64) -> Vec<AckRange> {
        if lower > upper {
            return Vec::new();
        }

        let newly_covered = self.gaps_in(lower, upper);
        if newly_covered.is_empty() {
            return newly_covered;
        }

        let mut merged_lower = lower;
        let mut merged_upper = upper;

        // merge with an interval below that overlaps or is adjacent
        if let Some((&prev_lower, &prev_upper)) = self.ranges.range(..=lower).next_back() {
            if prev_upper.saturating_add(1) >= lower {
                merged_lower = prev_lower;
                merged_upper = merged_upper.max(prev_upper);
            }
        }

        // absorb all intervals starting inside the merged interval or immediately above it
        let absorbed = self.ranges
            .range(merged_lower..=merged_upper.saturating_add(1))
            .map(|(&l, &u)| (l, u))
            .collect::<Vec<_>>();
        for (l, u) in absorbed {
            self.ranges.remove(&l);
            merged_upper = merged_upper.max(u);
        }

        self.ranges.insert(merged_lower, merged_upper);
        newly_covered
    }

    pub fn union(&mut self, other: &AckRangeSet) {
        for (&lower, &upper) in &other.ranges {
            self.insert_range(lower, upper);
        }
    }

    pub fn ranges(&self) -> impl Iterator<Item=AckRange> + '_ {
        self.ranges.iter()
            .map(|(&lower, &upper)| AckRange { lower, upper })
    }

    pub fn to_ack_ranges(&self) -> Vec<AckRange> {
        self.ranges().collect()
    }

    /// the sub-ranges of `[lower, upper]` that are not in the set
    fn gaps_in(&self, lower: u64, upper: u64) -> Vec<AckRange> {
        let mut result = Vec::new();
        let mut cursor = lower;

        let first_candidate = self.ranges.range(..=lower).next_back()
            .map(|(&l, _)| l)
            .unwrap_or(lower);

        for (&l, &u) in self.ranges.range(first_candidate..=upper) {
            if u < cursor {
                continue;
            }
            if l > cursor {
                result.push(AckRange::new(cursor, l - 1));
            }
            match u.checked_add(1) {
                Some(next) => cursor = next,
                None => return result,
            }
            if cursor > upper {
                return result;
            }
        }

        result.push(AckRange::new(cursor, upper));
        result
    }
}

impl FromIterator<AckRange> for AckRangeSet {
    fn from_iter<T: IntoIterator<Item=AckRange>>(iter: T) -> Self {
        let mut result = AckRangeSet::new();
        for range in iter {
            result.insert_range(range.lower, range.upper);
        }
        result
    }
}

/// `[1,3][5,5]`
impl Display for AckRangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (lower, upper) in &self.ranges {
            write!(f, "[{},{}]", lower, upper)?;
        }
        Ok(())
    }
}

impl Debug for AckRangeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AckRangeSet{{{}}}", self)
    }
}

impl FromStr for AckRangeSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = AckRangeSet::new();
        let mut rest = s.trim();
        while !rest.is_empty() {
            let Some(stripped) = rest.strip_prefix('[') else {
                bail!("expected '[' in range string {:?}", s);
            };
            let end = stripped.find(']')
                .ok_or_else(|| anyhow!("unterminated range in range string {:?}", s))?;
            let (lower, upper) = stripped[..end].split_once(',')
                .ok_or_else(|| anyhow!("range without ',' in range string {:?}", s))?;
            let lower: u64 = lower.trim().parse()?;
            let upper: u64 = upper.trim().parse()?;
            if lower > upper {
                bail!("range [{},{}] has lower bound above upper bound", lower, upper);
            }
            result.insert_range(lower, upper);
            rest = stripped[end+1..].trim_start();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn set_from(ranges: &[(u64, u64)]) -> AckRangeSet {
        let mut result = AckRangeSet::new();
        for &(l, u) in ranges {
            result.insert_range(l, u);
        }
        result
    }

    #[rstest]
    #[case::empty(vec![], "")]
    #[case::single(vec![(1,1)], "[1,1]")]
    #[case::adjacent_merged(vec![(1,3), (4,5)], "[1,5]")]
    #[case::adjacent_reverse(vec![(4,5), (1,3)], "[1,5]")]
    #[case::overlapping(vec![(1,4), (3,6)], "[1,6]")]
    #[case::disjoint(vec![(1,2), (5,6)], "[1,2][5,6]")]
    #[case::gap_filled(vec![(1,2), (5,6), (3,4)], "[1,6]")]
    #[case::enveloping(vec![(2,3), (5,6), (8,8), (1,9)], "[1,9]")]
    #[case::partially_enveloping(vec![(2,3), (5,10), (1,6)], "[1,10]")]
    #[case::contained(vec![(1,10), (3,4)], "[1,10]")]
    #[case::below(vec![(5,6), (1,2)], "[1,2][5,6]")]
    #[case::upper_bound(vec![(u64::MAX-1, u64::MAX), (u64::MAX-3, u64::MAX-2)], "[18446744073709551612,18446744073709551615]")]
    fn test_insert_range(#[case] ranges: Vec<(u64, u64)>, #[case] expected: &str) {
        let set = set_from(&ranges);
        assert_eq!(set.to_string(), expected);
    }

    #[rstest]
    #[case::single(vec![(1,1)])]
    #[case::disjoint(vec![(1,2), (5,6)])]
    #[case::merged(vec![(1,3), (4,9), (12,12)])]
    fn test_insert_is_idempotent(#[case] ranges: Vec<(u64, u64)>) {
        let mut set = set_from(&ranges);
        let before = set.clone();
        for &(l, u) in &ranges {
            assert!(set.insert_range(l, u).is_empty());
        }
        assert_eq!(set, before);
    }

    #[rstest]
    #[case::into_empty(vec![], (3,5), vec![(3,5)])]
    #[case::already_covered(vec![(1,10)], (3,5), vec![])]
    #[case::overlap_below(vec![(1,4)], (3,6), vec![(5,6)])]
    #[case::overlap_above(vec![(5,8)], (3,6), vec![(3,4)])]
    #[case::holes(vec![(2,3), (6,7)], (1,9), vec![(1,1), (4,5), (8,9)])]
    #[case::inner_hole(vec![(1,3), (6,9)], (2,8), vec![(4,5)])]
    fn test_newly_covered(#[case] initial: Vec<(u64, u64)>, #[case] inserted: (u64, u64), #[case] expected: Vec<(u64, u64)>) {
        let mut set = set_from(&initial);
        let newly = set.insert_range(inserted.0, inserted.1)
            .into_iter()
            .map(|r| (r.lower, r.upper))
            .collect::<Vec<_>>();
        assert_eq!(newly, expected);
    }

    #[rstest]
    #[case::contiguous(vec![1,2,3,4,5])]
    #[case::reverse(vec![5,4,3,2,1])]
    #[case::interleaved(vec![2,4,1,5,3])]
    #[case::odd_then_even(vec![1,3,5,2,4])]
    fn test_complete_up_to_insertion_order(#[case] numbers: Vec<u64>) {
        let mut set = AckRangeSet::new();
        for (idx, &n) in numbers.iter().enumerate() {
            set.insert(n);
            let inserted = &numbers[..=idx];
            for bound in 0..=6 {
                let expected = (1..=bound).all(|k| inserted.contains(&k));
                assert_eq!(set.complete_up_to(bound), expected, "after inserting {:?}, bound {}", inserted, bound);
            }
        }
        assert_eq!(set.to_string(), "[1,5]");
    }

    #[rstest]
    #[case::empty(vec![], 0, false)]
    #[case::below(vec![(1,3)], 0, false)]
    #[case::first(vec![(1,3)], 1, true)]
    #[case::inside(vec![(1,3), (7,9)], 8, true)]
    #[case::gap(vec![(1,3), (7,9)], 5, false)]
    #[case::above(vec![(1,3), (7,9)], 10, false)]
    fn test_contains(#[case] ranges: Vec<(u64, u64)>, #[case] number: u64, #[case] expected: bool) {
        assert_eq!(set_from(&ranges).contains(number), expected);
    }

    #[test]
    fn test_union() {
        let mut a = set_from(&[(1,2), (7,8)]);
        let b = set_from(&[(3,4), (10,12)]);
        a.union(&b);
        assert_eq!(a.to_string(), "[1,4][7,8][10,12]");
        assert_eq!(a.contiguous_upper_bound(), 4);
        assert_eq!(a.highest(), Some(12));
    }

    #[rstest]
    #[case::empty("", "")]
    #[case::single("[1,3]", "[1,3]")]
    #[case::merged("[1,3][4,6]", "[1,6]")]
    #[case::whitespace(" [1, 3] [5,5] ", "[1,3][5,5]")]
    fn test_parse(#[case] s: &str, #[case] expected: &str) {
        let parsed: AckRangeSet = s.parse().unwrap();
        assert_eq!(parsed.to_string(), expected);
    }

    #[rstest]
    #[case::no_bracket("1,3")]
    #[case::unterminated("[1,3")]
    #[case::no_comma("[13]")]
    #[case::inverted("[3,1]")]
    #[case::not_a_number("[a,3]")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(s.parse::<AckRangeSet>().is_err());
    }
}
