//! `HyperValue`: a [`Space`] paired with a chain of composable transforms.
//!
//! Mirrors `lighttuner.hpo.value.value.HyperValue`: each arithmetic operator
//! or `.map(...)` call returns a *new* value with one more transform appended,
//! never mutates in place. `trans(x)` folds the raw space draw through every
//! transform in order.

use crate::space::Space;
use rand::Rng;
use std::fmt;
use std::sync::Arc;

type Transform = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

#[derive(Clone)]
pub struct HyperValue {
    space: Space,
    funcs: Vec<Transform>,
}

impl fmt::Debug for HyperValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperValue")
            .field("space", &self.space)
            .field("funcs", &self.funcs.len())
            .finish()
    }
}

impl HyperValue {
    pub fn new(space: Space) -> Self {
        HyperValue { space, funcs: Vec::new() }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    /// Append one more transform, returning a new `HyperValue`. The original
    /// is left untouched so a `HyperValue` can be extended from multiple
    /// call sites without aliasing surprises.
    pub fn then(&self, f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> HyperValue {
        let mut funcs = self.funcs.clone();
        funcs.push(Arc::new(f));
        HyperValue { space: self.space, funcs }
    }

    pub fn trans(&self, x: f64) -> f64 {
        self.funcs.iter().fold(x, |acc, f| f(acc))
    }

    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        self.trans(self.space.sample(rng))
    }

    pub fn neg(&self) -> HyperValue {
        self.then(|x| -x)
    }

    pub fn add(&self, other: f64) -> HyperValue {
        self.then(move |x| x + other)
    }

    pub fn sub(&self, other: f64) -> HyperValue {
        self.then(move |x| x - other)
    }

    pub fn rsub(&self, other: f64) -> HyperValue {
        self.then(move |x| other - x)
    }

    pub fn mul(&self, other: f64) -> HyperValue {
        self.then(move |x| x * other)
    }

    pub fn div(&self, other: f64) -> HyperValue {
        self.then(move |x| x / other)
    }

    pub fn rdiv(&self, other: f64) -> HyperValue {
        self.then(move |x| other / x)
    }

    pub fn floordiv(&self, other: f64) -> HyperValue {
        self.then(move |x| (x / other).floor())
    }

    pub fn rem(&self, other: f64) -> HyperValue {
        self.then(move |x| x.rem_euclid(other))
    }

    pub fn pow(&self, other: f64) -> HyperValue {
        self.then(move |x| x.powf(other))
    }
}

/// `uniform(lbound, ubound)`: a continuous draw in `[lbound, ubound)`.
pub fn uniform(lbound: f64, ubound: f64) -> Result<HyperValue, crate::error::SpaceError> {
    Ok(HyperValue::new(Space::continuous(lbound, ubound)?))
}

/// `quniform(start, end, step)`: an evenly-stepped inclusive draw over
/// `[start, end]`. Fails with `InvalidRange` if `start > end`, `NonPositiveStep`
/// if `step <= 0`; `count = floor((end - start) / step) + 1` per spec §3.
pub fn quniform(start: f64, end: f64, step: f64) -> Result<HyperValue, crate::error::SpaceError> {
    if start > end {
        return Err(crate::error::SpaceError::InvalidRange { start, end });
    }
    if !(step > 0.0) {
        return Err(crate::error::SpaceError::NonPositiveStep { step });
    }
    let count = ((end - start) / step).floor() as u64 + 1;
    Ok(HyperValue::new(Space::stepped(start, step, count)?))
}

/// `randint(lo, hi)`: an integer drawn uniformly from `[lo, hi)`.
pub fn randint(lo: i64, hi: i64) -> Result<HyperValue, crate::error::SpaceError> {
    let count = (hi - lo).max(0) as u64;
    let space = Space::stepped(lo as f64, 1.0, count)?;
    Ok(HyperValue::new(space))
}

/// `choice(n)`: an index drawn uniformly from `0..n`, left untransformed so
/// callers can `.then(|i| options[i as usize])`-style map it themselves via
/// [`crate::template`].
pub fn choice(n: u64) -> Result<HyperValue, crate::error::SpaceError> {
    Ok(HyperValue::new(Space::fixed(n)?))
}

/// `randn(mu, sigma)`: a standard-normal draw over `Continuous(0, 1)`, mapped
/// through the inverse normal CDF then scaled, yielding `±inf` exactly at the
/// space's open boundary.
pub fn randn(mu: f64, sigma: f64) -> Result<HyperValue, crate::error::SpaceError> {
    let base = uniform(0.0, 1.0)?;
    Ok(base.then(move |p| mu + sigma * inverse_normal_cdf(p)))
}

/// Acklam's rational approximation to the inverse standard normal CDF.
/// Returns `±inf` at `p == 0.0` / `p == 1.0` respectively.
fn inverse_normal_cdf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    const A: [f64; 6] = [
        -3.969_683_028_665_376e+01,
        2.209_460_984_245_205e+02,
        -2.759_285_104_469_687e+02,
        1.383_577_518_672_690e+02,
        -3.066_479_806_614_716e+01,
        2.506_628_277_459_239e+00,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e+01,
        1.615_858_368_580_409e+02,
        -1.556_989_798_598_866e+02,
        6.680_131_188_771_972e+01,
        -1.328_068_155_288_572e+01,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-03,
        -3.223_964_580_411_365e-01,
        -2.400_758_277_161_838e+00,
        -2.549_732_539_343_734e+00,
        4.374_664_141_464_968e+00,
        2.938_163_982_698_783e+00,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-03,
        3.224_671_290_700_398e-01,
        2.445_134_137_142_996e+00,
        3.754_408_661_907_416e+00,
    ];

    const P_LOW: f64 = 0.02425;
    let p_high = 1.0 - P_LOW;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= p_high {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn then_is_immutable_and_composes_in_order() {
        let base = uniform(0.0, 1.0).unwrap();
        let scaled = base.add(1.0).mul(2.0);
        assert_eq!(base.trans(0.5), 0.5);
        assert_eq!(scaled.trans(0.5), (0.5 + 1.0) * 2.0);
    }

    #[test]
    fn randn_hits_infinities_at_exact_boundaries() {
        let hv = randn(0.0, 1.0).unwrap();
        assert_eq!(hv.trans(0.0), f64::NEG_INFINITY);
        assert_eq!(hv.trans(1.0), f64::INFINITY);
        assert!(hv.trans(0.5).abs() < 1e-6);
    }

    #[test]
    fn randint_counts_half_open_range() {
        let hv = randint(3, 7).unwrap();
        assert_eq!(hv.space().count(), Some(4));
    }

    #[test]
    fn quniform_derives_count_and_rejects_inverted_range() {
        let hv = quniform(-5.0, 5.0, 1.0).unwrap();
        assert_eq!(hv.space().count(), Some(11));

        assert!(matches!(
            quniform(5.0, -5.0, 1.0),
            Err(crate::error::SpaceError::InvalidRange { .. })
        ));
        assert!(matches!(
            quniform(0.0, 1.0, 0.0),
            Err(crate::error::SpaceError::NonPositiveStep { .. })
        ));
    }
}
