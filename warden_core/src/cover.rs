//! Edge coverage primitive.

use crate::HashSet;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// One coverage sample: the unordered set of edge identifiers observed
/// during a single execution. No ordering is guaranteed across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cover(HashSet<u64>);

impl Cover {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn contains(&self, pc: u64) -> bool {
        self.0.contains(&pc)
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }

    /// Merge `other` into `self`.
    pub fn merge(&mut self, other: &Cover) {
        self.0.extend(other.iter());
    }

    /// Edges of `self` not present in `other`.
    pub fn difference(&self, other: &Cover) -> Cover {
        self.iter().filter(|pc| !other.contains(*pc)).collect()
    }
}

impl FromIterator<u64> for Cover {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        Cover(iter.into_iter().collect())
    }
}

impl From<Vec<u64>> for Cover {
    fn from(pcs: Vec<u64>) -> Self {
        pcs.into_iter().collect()
    }
}

/// Select a subset of `covers` whose union equals the union of the whole
/// list and return its indices, ascending.
///
/// Greedy: samples are considered largest-first (ties broken by input
/// position) and kept when they still contribute an unseen edge. Equal
/// input always yields equal output.
pub fn minimize(covers: &[Cover]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..covers.len()).collect();
    order.sort_by_key(|&i| (Reverse(covers[i].len()), i));

    let mut covered: HashSet<u64> = HashSet::default();
    let mut keep = Vec::new();
    for i in order {
        if covers[i].iter().any(|pc| !covered.contains(&pc)) {
            covered.extend(covers[i].iter());
            keep.push(i);
        }
    }
    keep.sort_unstable();
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cover(pcs: &[u64]) -> Cover {
        pcs.iter().copied().collect()
    }

    #[test]
    fn difference_and_merge() {
        let mut a = cover(&[1, 2, 3]);
        let b = cover(&[2, 3, 4]);
        assert_eq!(a.difference(&b), cover(&[1]));
        assert_eq!(b.difference(&a), cover(&[4]));
        a.merge(&b);
        assert_eq!(a, cover(&[1, 2, 3, 4]));
        assert!(a.difference(&a).is_empty());
    }

    #[test]
    fn minimize_keeps_union() {
        let covers = vec![
            cover(&[1, 2]),
            cover(&[1, 2, 3, 4]),
            cover(&[3, 4]),
            cover(&[5]),
        ];
        let keep = minimize(&covers);
        assert_eq!(keep, vec![1, 3]);

        let mut union = Cover::new();
        for &i in &keep {
            union.merge(&covers[i]);
        }
        let mut total = Cover::new();
        for c in &covers {
            total.merge(c);
        }
        assert_eq!(union, total);
    }

    #[test]
    fn minimize_is_deterministic() {
        let covers = vec![cover(&[1, 2]), cover(&[3, 4]), cover(&[1, 3])];
        let first = minimize(&covers);
        for _ in 0..10 {
            assert_eq!(minimize(&covers), first);
        }
        // equal sizes: input order breaks the tie
        assert_eq!(first, vec![0, 1]);
    }

    #[test]
    fn minimize_empty_input() {
        assert!(minimize(&[]).is_empty());
    }
}
