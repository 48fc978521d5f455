//! Leaf search-space primitives.
//!
//! A [`Space`] describes the raw domain a single scalar is drawn from, before
//! any [`crate::value::HyperValue`] transform is applied. The three variants
//! mirror `lighttuner`'s `ContinuousSpace` / `SeparateSpace` / `FixedSpace`:
//! a bounded real interval, an evenly-stepped integer range, and a fixed set
//! of indices.

use crate::error::SpaceError;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Space {
    /// A bounded real interval `[lbound, ubound)`.
    Continuous { lbound: f64, ubound: f64 },
    /// `count` evenly spaced integer steps starting at `start` with spacing `step`.
    Stepped { start: f64, step: f64, count: u64 },
    /// `count` fixed choices, referenced by index `0..count`.
    Fixed { count: u64 },
}

impl Space {
    pub fn continuous(lbound: f64, ubound: f64) -> Result<Self, SpaceError> {
        if !(lbound < ubound) {
            return Err(SpaceError::InvalidBounds { lbound, ubound });
        }
        Ok(Space::Continuous { lbound, ubound })
    }

    pub fn stepped(start: f64, step: f64, count: u64) -> Result<Self, SpaceError> {
        if !(step > 0.0) {
            return Err(SpaceError::NonPositiveStep { step });
        }
        Ok(Space::Stepped { start, step, count })
    }

    pub fn fixed(count: u64) -> Result<Self, SpaceError> {
        if count == 0 {
            return Err(SpaceError::EmptyFixedSpace);
        }
        Ok(Space::Fixed { count })
    }

    /// Number of distinct points this space can ever produce, or `None` if
    /// unbounded (only `Continuous` is unbounded).
    pub fn count(&self) -> Option<u64> {
        match self {
            Space::Continuous { .. } => None,
            Space::Stepped { count, .. } => Some(*count),
            Space::Fixed { count } => Some(*count),
        }
    }

    /// `length` as used by the grid ordering/allocation formulas: the
    /// continuous analogue of `count`, always finite (`1` for `Continuous`
    /// since it has no natural cardinality until allocated).
    pub fn length(&self) -> f64 {
        match self {
            Space::Continuous { .. } => 1.0,
            Space::Stepped { count, .. } => *count as f64,
            Space::Fixed { count } => *count as f64,
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Space::Continuous { .. })
    }

    /// Draw a single raw value uniformly from this space.
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        match *self {
            Space::Continuous { lbound, ubound } => rng.random::<f64>() * (ubound - lbound) + lbound,
            Space::Stepped { start, step, count } => {
                let idx = rng.random_range(0..count) as f64;
                start + idx * step
            }
            Space::Fixed { count } => rng.random_range(0..count) as f64,
        }
    }

    /// Allocate `n` grid points for a continuous space, inclusive of both bounds.
    pub fn allocate_continuous(lbound: f64, ubound: f64, n: u64) -> Vec<f64> {
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![(lbound + ubound) / 2.0];
        }
        (0..n)
            .map(|x| x as f64 / (n - 1) as f64 * (ubound - lbound) + lbound)
            .collect()
    }

    /// Allocate `cnt` grid indices out of `count` evenly-stepped points.
    pub fn allocate_stepped(count: u64, cnt: u64) -> Vec<u64> {
        if cnt == 0 {
            return Vec::new();
        }
        if cnt == 1 {
            return vec![(count - 1) / 2];
        }
        if cnt >= count {
            return (0..count).collect();
        }
        let unit = (count - 1) as f64 / (cnt - 1) as f64;
        (0..cnt).map(|i| (i as f64 * unit).round() as u64).collect()
    }

    /// Allocate every index of a fixed space (there is no budget to distribute).
    pub fn allocate_fixed(count: u64) -> Vec<u64> {
        (0..count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuous_rejects_inverted_bounds() {
        assert!(Space::continuous(1.0, 1.0).is_err());
        assert!(Space::continuous(2.0, 1.0).is_err());
        assert!(Space::continuous(0.0, 1.0).is_ok());
    }

    #[test]
    fn allocate_continuous_spans_bounds_inclusive() {
        let pts = Space::allocate_continuous(0.0, 10.0, 5);
        assert_eq!(pts, vec![0.0, 2.5, 5.0, 7.5, 10.0]);
        assert_eq!(Space::allocate_continuous(0.0, 10.0, 1), vec![5.0]);
        assert_eq!(Space::allocate_continuous(0.0, 10.0, 0), Vec::<f64>::new());
    }

    #[test]
    fn allocate_stepped_clamps_to_available_count() {
        assert_eq!(Space::allocate_stepped(3, 10), vec![0, 1, 2]);
        assert_eq!(Space::allocate_stepped(10, 1), vec![4]);
    }

    #[test]
    fn allocate_fixed_covers_every_choice() {
        assert_eq!(Space::allocate_fixed(4), vec![0, 1, 2, 3]);
    }
}
