//! Bayesian optimization via a from-scratch Gaussian Process surrogate.
//!
//! Grounded in `ditk/hpo/algorithm/bayes/algorithm.py` and `bayes/utils.py`.
//! The original defers `fit`/`predict` to `sklearn`'s `GaussianProcessRegressor`
//! and its acquisition search to `scipy.optimize`; this crate has no BLAS/LAPACK
//! link dependency in the teacher workspace, so both are hand-rolled here:
//! a Matern 5/2 kernel fit by Cholesky decomposition (`ndarray`, already a
//! teacher dependency via `tools`'s optional NNUE feature), and acquisition
//! maximization via random warm-up sampling plus bounded coordinate
//! hill-climbing restarts, matching `bayes/utils.py`'s `acq_max` contract
//! ("keep the warm-up maximum if the local optimizer's best candidate is
//! dominated by it").

use crate::algorithm::base::{is_service_closed, reconstruct_config, Algorithm, Session, SessionCore, SessionParams, SessionState};
use crate::error::{CoreError, SpaceError};
use crate::runner::RunnerHooks;
use crate::service::{ExecOutcome, ThreadService};
use crate::space::Space;
use crate::template::SpaceTemplate;
use crate::value::HyperValue;
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};

/// Which acquisition function guides the next probe, matching
/// `bayes/utils.py`'s `UtilityFunction` kinds.
#[derive(Debug, Clone, Copy)]
pub enum Acquisition {
    Ucb { kappa: f64 },
    Ei { xi: f64 },
    Poi { xi: f64 },
}

impl Default for Acquisition {
    fn default() -> Self {
        Acquisition::Ucb { kappa: 2.576 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BayesAlgorithm {
    init_steps: u64,
    acquisition: Acquisition,
    n_warmup: usize,
    n_iter: usize,
    length_scale: f64,
    noise: f64,
    seed: Option<u64>,
}

impl Default for BayesAlgorithm {
    fn default() -> Self {
        BayesAlgorithm {
            init_steps: 10,
            acquisition: Acquisition::default(),
            n_warmup: 10_000,
            n_iter: 10,
            length_scale: 1.0,
            noise: 1e-6,
            seed: None,
        }
    }
}

impl BayesAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_steps(mut self, n: u64) -> Self {
        self.init_steps = n.max(1);
        self
    }

    pub fn acquisition(mut self, a: Acquisition) -> Self {
        self.acquisition = a;
        self
    }

    pub fn n_warmup(mut self, n: usize) -> Self {
        self.n_warmup = n;
        self
    }

    pub fn n_iter(mut self, n: usize) -> Self {
        self.n_iter = n;
        self
    }

    pub fn length_scale(mut self, l: f64) -> Self {
        self.length_scale = l;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Algorithm for BayesAlgorithm {
    fn name(&self) -> &'static str {
        "bayes"
    }

    fn get_session(
        &self,
        template: SpaceTemplate,
        service: Arc<ThreadService<RunnerHooks>>,
        params: SessionParams,
    ) -> Result<Arc<dyn Session>, CoreError> {
        let leaves = template.leaves();
        let mut bounds = Vec::with_capacity(leaves.len());
        for hv in &leaves {
            bounds.push(project_bounds(hv.space())?);
        }
        Ok(Arc::new(BayesSession {
            core: SessionCore::new(service),
            template,
            leaves,
            bounds,
            max_steps: params.max_steps,
            maximize: params.maximize,
            cfg: *self,
            state: Mutex::new(BayesState { x: Vec::new(), y: Vec::new(), gp: None }),
        }))
    }
}

/// Map a non-continuous space onto a real box `[lo, hi)` bayes can search,
/// per spec 4.6. `Fixed` spaces have no natural ordering to project onto, so
/// bayes refuses to construct a session over them.
fn project_bounds(space: &Space) -> Result<(f64, f64), SpaceError> {
    match *space {
        Space::Continuous { lbound, ubound } => Ok((lbound, ubound)),
        Space::Stepped { count, .. } => Ok((0.0, count as f64)),
        Space::Fixed { .. } => Err(SpaceError::FixedUnsupportedByBayes),
    }
}

/// Invert [`project_bounds`]: turn a probed real value back into the raw
/// pre-transform scalar the space actually produces.
fn unproject(space: &Space, probed: f64) -> f64 {
    match *space {
        Space::Continuous { .. } => probed,
        Space::Stepped { start, step, count } => {
            let idx = (probed.floor() as i64).clamp(0, count as i64 - 1) as f64;
            start + idx * step
        }
        Space::Fixed { .. } => unreachable!("bayes rejects Fixed spaces at construction"),
    }
}

struct BayesState {
    x: Vec<Vec<f64>>,
    y: Vec<f64>,
    gp: Option<Arc<GaussianProcess>>,
}

struct BayesSession {
    core: Arc<SessionCore>,
    template: SpaceTemplate,
    leaves: Vec<HyperValue>,
    bounds: Vec<(f64, f64)>,
    max_steps: Option<u64>,
    maximize: bool,
    cfg: BayesAlgorithm,
    state: Mutex<BayesState>,
}

impl Session for BayesSession {
    fn start(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.core.start(move || this.run());
    }

    fn join(&self) {
        self.core.join();
    }

    fn state(&self) -> SessionState {
        self.core.state()
    }

    fn error(&self) -> Option<String> {
        self.core.error()
    }
}

impl BayesSession {
    fn run(self: Arc<Self>) -> Result<(), CoreError> {
        let mut rng = match self.cfg.seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_os_rng(),
        };

        loop {
            if let Some(max) = self.max_steps {
                if self.core.emitted() >= max {
                    return Ok(());
                }
            }

            let (gp_opt, y_len, y_best) = {
                let st = self.state.lock().unwrap();
                let best = st.y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (st.gp.clone(), st.y.len() as u64, best)
            };

            let probe = if gp_opt.is_none() || y_len < self.cfg.init_steps {
                self.bounds.iter().map(|&(lo, hi)| rng.random::<f64>() * (hi - lo) + lo).collect::<Vec<_>>()
            } else {
                let gp = gp_opt.unwrap();
                acq_max(&gp, self.cfg.acquisition, &self.bounds, y_best, self.cfg.n_warmup, self.cfg.n_iter, &mut rng)
            };
            let probe: Vec<f64> =
                probe.iter().zip(&self.bounds).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect();

            let raw: Vec<f64> =
                probe.iter().zip(self.leaves.iter()).map(|(&p, hv)| unproject(hv.space(), p)).collect();
            let config = reconstruct_config(&self.template, &self.leaves, &raw);

            let this = Arc::clone(&self);
            match self.core.put(config, Some(probe), move |task, outcome| this.observe(task, outcome)) {
                Ok(()) => {}
                Err(e) if is_service_closed(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// The session's own success callback (`_return_on_success`): appends
    /// `(x_probe, y)` to the observation set and refits the surrogate, per
    /// the `fit_steps = 1` cadence in spec 4.6.
    fn observe(&self, task: &crate::task::Task, outcome: &ExecOutcome<crate::task::RunResult>) {
        let ExecOutcome::Ok(result) = outcome else { return };
        let Ok(value) = result.value() else { return };
        let Some(y) = value.as_f64() else { return };
        let Some(x_probe) = task.attachment.clone() else { return };
        let signed = if self.maximize { y } else { -y };

        let mut st = self.state.lock().unwrap();
        st.x.push(x_probe);
        st.y.push(signed);
        if st.y.len() as u64 >= self.cfg.init_steps {
            let gp = GaussianProcess::fit(self.cfg.length_scale, self.cfg.noise, st.x.clone(), &st.y);
            st.gp = Some(Arc::new(gp));
        }
    }
}

/// A Matern 5/2 Gaussian Process regressor, fit by Cholesky decomposition.
struct GaussianProcess {
    length_scale: f64,
    x: Vec<Vec<f64>>,
    y_mean: f64,
    l: Array2<f64>,
    alpha: Array1<f64>,
}

impl GaussianProcess {
    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let r = a.iter().zip(b).map(|(p, q)| (p - q).powi(2)).sum::<f64>().sqrt();
        let t = 5f64.sqrt() * r / self.length_scale;
        (1.0 + t + t * t / 3.0) * (-t).exp()
    }

    fn fit(length_scale: f64, noise: f64, x: Vec<Vec<f64>>, y: &[f64]) -> Self {
        let n = x.len();
        let y_mean = y.iter().sum::<f64>() / n as f64;

        let mut gp = GaussianProcess { length_scale, x, y_mean, l: Array2::zeros((n, n)), alpha: Array1::zeros(n) };

        let mut k = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                let v = gp.kernel(&gp.x[i], &gp.x[j]);
                k[[i, j]] = v + if i == j { noise } else { 0.0 };
            }
        }
        let l = cholesky(&k);
        let centered = Array1::from(y.iter().map(|v| v - y_mean).collect::<Vec<_>>());
        let z = forward_substitution(&l, &centered);
        let alpha = back_substitution(&l, &z);
        gp.l = l;
        gp.alpha = alpha;
        gp
    }

    fn predict(&self, x: &[f64]) -> (f64, f64) {
        let n = self.x.len();
        let k_star = Array1::from((0..n).map(|i| self.kernel(x, &self.x[i])).collect::<Vec<_>>());
        let mean = self.y_mean + k_star.dot(&self.alpha);
        let v = forward_substitution(&self.l, &k_star);
        let var = (self.kernel(x, x) - v.dot(&v)).max(1e-12);
        (mean, var.sqrt())
    }
}

fn cholesky(k: &Array2<f64>) -> Array2<f64> {
    let n = k.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for p in 0..j {
                sum += l[[i, p]] * l[[j, p]];
            }
            if i == j {
                l[[i, j]] = (k[[i, i]] - sum).max(1e-10).sqrt();
            } else {
                l[[i, j]] = (k[[i, j]] - sum) / l[[j, j]];
            }
        }
    }
    l
}

fn forward_substitution(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }
    y
}

/// Solves `L^T x = b` for upper-triangular `L^T`.
fn back_substitution(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (b[i] - sum) / l[[i, i]];
    }
    x
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// `UtilityFunction.utility` in `bayes/utils.py`: UCB/EI/POI evaluated at one
/// point's predicted `(mean, std)`, given the best observed (already
/// direction-normalized, i.e. "bigger is better") target `y_best`.
fn acquire(acq: Acquisition, mean: f64, std: f64, y_best: f64) -> f64 {
    match acq {
        Acquisition::Ucb { kappa } => mean + kappa * std,
        Acquisition::Ei { xi } => {
            if std <= 1e-12 {
                return 0.0;
            }
            let z = (mean - y_best - xi) / std;
            (mean - y_best - xi) * normal_cdf(z) + std * normal_pdf(z)
        }
        Acquisition::Poi { xi } => {
            if std <= 1e-12 {
                return 0.0;
            }
            normal_cdf((mean - y_best - xi) / std)
        }
    }
}

/// `acq_max`: warm-up random sampling plus bounded coordinate hill-climbing
/// restarts. If the local search's best candidate doesn't beat the warm-up
/// maximum, the warm-up maximum is kept (spec 4.6 step 2).
fn acq_max(
    gp: &GaussianProcess,
    acq: Acquisition,
    bounds: &[(f64, f64)],
    y_best: f64,
    n_warmup: usize,
    n_iter: usize,
    rng: &mut impl Rng,
) -> Vec<f64> {
    let d = bounds.len();
    let score = |x: &[f64]| -> f64 {
        let (mean, std) = gp.predict(x);
        acquire(acq, mean, std, y_best)
    };

    let mut warmup_best_x: Vec<f64> = bounds.iter().map(|&(lo, hi)| (lo + hi) / 2.0).collect();
    let mut warmup_best_score = f64::NEG_INFINITY;
    for _ in 0..n_warmup {
        let x: Vec<f64> = bounds.iter().map(|&(lo, hi)| rng.random::<f64>() * (hi - lo) + lo).collect();
        let s = score(&x);
        if s > warmup_best_score {
            warmup_best_score = s;
            warmup_best_x = x;
        }
    }

    let mut local_best_x = warmup_best_x.clone();
    let mut local_best_score = warmup_best_score;
    for _ in 0..n_iter {
        let mut x: Vec<f64> = bounds.iter().map(|&(lo, hi)| rng.random::<f64>() * (hi - lo) + lo).collect();
        let mut s = score(&x);
        let mut step: Vec<f64> = bounds.iter().map(|&(lo, hi)| (hi - lo) * 0.1).collect();
        for _ in 0..50 {
            let mut improved = false;
            for i in 0..d {
                for dir in [1.0, -1.0] {
                    let mut cand = x.clone();
                    cand[i] = (cand[i] + dir * step[i]).clamp(bounds[i].0, bounds[i].1);
                    let cs = score(&cand);
                    if cs > s {
                        x = cand;
                        s = cs;
                        improved = true;
                    }
                }
            }
            if !improved {
                step.iter_mut().for_each(|st| *st *= 0.5);
                if step.iter().all(|st| *st < 1e-6) {
                    break;
                }
            }
        }
        if s > local_best_score {
            local_best_score = s;
            local_best_x = x;
        }
    }

    if warmup_best_score >= local_best_score {
        warmup_best_x
    } else {
        local_best_x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_space_is_rejected_at_construction() {
        let spaces = [Space::fixed(4).unwrap()];
        assert!(matches!(project_bounds(&spaces[0]), Err(SpaceError::FixedUnsupportedByBayes)));
    }

    #[test]
    fn gp_fits_a_simple_quadratic() {
        let xs: Vec<Vec<f64>> = (-5..=5).map(|i| vec![i as f64]).collect();
        let ys: Vec<f64> = xs.iter().map(|x| -(x[0] * x[0])).collect();
        let gp = GaussianProcess::fit(2.0, 1e-6, xs, &ys);
        let (mean, std) = gp.predict(&[0.0]);
        assert!(mean > -1.0, "expected the peak to be predicted near 0, got mean={mean}");
        assert!(std >= 0.0);
    }

    #[test]
    fn ucb_rewards_high_mean_and_high_uncertainty() {
        assert!(acquire(Acquisition::Ucb { kappa: 2.0 }, 1.0, 1.0, 0.0) > acquire(Acquisition::Ucb { kappa: 2.0 }, 1.0, 0.0, 0.0));
    }

    #[test]
    fn stepped_bounds_project_to_zero_count_and_invert_via_floor() {
        let space = Space::stepped(-10.0, 0.5, 20).unwrap();
        assert_eq!(project_bounds(&space).unwrap(), (0.0, 20.0));
        assert_eq!(unproject(&space, 3.9), -10.0 + 3.0 * 0.5);
    }
}
