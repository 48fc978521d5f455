//! Deterministic Cartesian grid search.
//!
//! Grounded in `ditk/hpo/algorithm/grid/algorithm.py` and
//! `grid/allocation.py`: dimensions are ordered `Fixed < Stepped(by count) <
//! Continuous` so the cheapest-to-enumerate dimensions get their full
//! cardinality first, a geometric per-dimension budget is distributed across
//! the remaining non-fixed dimensions, and the actual enumeration walks a
//! plain odometer over the allocated per-dimension sample points, unordered
//! back to each leaf's original position before reconstruction.

use crate::algorithm::base::{is_service_closed, reconstruct_config, Algorithm, Session, SessionCore, SessionParams, SessionState};
use crate::error::{CoreError, SpaceError};
use crate::runner::RunnerHooks;
use crate::service::ThreadService;
use crate::space::Space;
use crate::template::SpaceTemplate;
use crate::value::HyperValue;
use std::sync::Arc;

/// `ditk`'s `GridAlgorithm`: no knobs of its own, every dimension's sample
/// count is derived purely from the space and `SessionParams::max_steps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GridAlgorithm;

impl GridAlgorithm {
    pub fn new() -> Self {
        GridAlgorithm
    }
}

impl Algorithm for GridAlgorithm {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn get_session(
        &self,
        template: SpaceTemplate,
        service: Arc<ThreadService<RunnerHooks>>,
        params: SessionParams,
    ) -> Result<Arc<dyn Session>, CoreError> {
        let leaves = template.leaves();
        let spaces: Vec<Space> = leaves.iter().map(|hv| *hv.space()).collect();
        let allocations = allocate_counts(&spaces, params.max_steps)?;
        let order = dimension_order(&spaces);
        Ok(Arc::new(GridSession {
            core: SessionCore::new(service),
            template,
            leaves,
            allocations,
            order,
            max_steps: params.max_steps,
        }))
    }
}

fn dim_rank(s: &Space) -> (u8, u64) {
    match s {
        Space::Fixed { count } => (0, *count),
        Space::Stepped { count, .. } => (1, *count),
        Space::Continuous { .. } => (2, u64::MAX),
    }
}

fn dimension_order(spaces: &[Space]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..spaces.len()).collect();
    order.sort_by_key(|&i| dim_rank(&spaces[i]));
    order
}

/// Distribute a total sample budget across the dimensions, per spec 4.4.
/// `Fixed` dimensions always get their full cardinality; the remaining
/// budget is shared geometrically across `Stepped`/`Continuous` dimensions,
/// consuming whatever each dimension actually used (after clamping to a
/// finite `count`) before moving to the next.
pub(crate) fn allocate_counts(spaces: &[Space], max_steps: Option<u64>) -> Result<Vec<u64>, SpaceError> {
    let n = spaces.len();
    let order = dimension_order(spaces);
    let has_continuous = spaces.iter().any(Space::is_continuous);

    let mut alloc = vec![0u64; n];

    let Some(max_steps) = max_steps else {
        if has_continuous {
            return Err(SpaceError::UnboundedContinuous);
        }
        for &i in &order {
            alloc[i] = spaces[i].count().unwrap_or(1);
        }
        return Ok(alloc);
    };

    for &i in &order {
        if let Space::Fixed { count } = spaces[i] {
            alloc[i] = count;
        }
    }

    let non_fixed: Vec<usize> = order.iter().copied().filter(|&i| !matches!(spaces[i], Space::Fixed { .. })).collect();
    if non_fixed.is_empty() {
        return Ok(alloc);
    }

    let total_len: f64 = spaces.iter().map(Space::length).product();
    let mut ratio = (max_steps as f64) / total_len.max(f64::MIN_POSITIVE);
    let mut remaining_dims = non_fixed.len();

    for &i in &non_fixed {
        let length = spaces[i].length();
        let ideal = (length * ratio.powf(1.0 / remaining_dims as f64)).max(1.0);
        let share = match spaces[i].count() {
            Some(c) => ideal.min(c as f64),
            None => ideal,
        };
        let chosen = share.round().max(1.0);
        alloc[i] = chosen as u64;

        // Consume exactly what this dimension used (not the unclamped ideal)
        // so a clamp on an earlier dimension doesn't starve later ones.
        ratio = (ratio / (chosen / length).max(f64::MIN_POSITIVE)).max(f64::MIN_POSITIVE);
        remaining_dims -= 1;
    }

    Ok(alloc)
}

fn sample_points(space: &Space, n: u64) -> Vec<f64> {
    match *space {
        Space::Continuous { lbound, ubound } => Space::allocate_continuous(lbound, ubound, n),
        Space::Stepped { start, step, count } => {
            Space::allocate_stepped(count, n).into_iter().map(|idx| start + idx as f64 * step).collect()
        }
        Space::Fixed { count } => Space::allocate_fixed(count).into_iter().map(|idx| idx as f64).collect(),
    }
}

struct GridSession {
    core: Arc<SessionCore>,
    template: SpaceTemplate,
    leaves: Vec<HyperValue>,
    allocations: Vec<u64>,
    order: Vec<usize>,
    max_steps: Option<u64>,
}

impl Session for GridSession {
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

impl GridSession {
    fn run(self: Arc<Self>) -> Result<(), CoreError> {
        let n = self.leaves.len();
        if n == 0 {
            // A template with no leaves has exactly one configuration.
            let config = reconstruct_config(&self.template, &self.leaves, &[]);
            match self.core.put(config, None, |_, _| {}) {
                Ok(()) | Err(CoreError::ServiceClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
            #[allow(unreachable_code)]
            return Ok(());
        }

        let points: Vec<Vec<f64>> =
            self.order.iter().map(|&i| sample_points(self.leaves[i].space(), self.allocations[i])).collect();
        if points.iter().any(Vec::is_empty) {
            return Ok(());
        }

        let mut idx = vec![0usize; self.order.len()];
        loop {
            if let Some(max) = self.max_steps {
                if self.core.emitted() >= max {
                    return Ok(());
                }
            }

            let mut raw = vec![0.0f64; n];
            for (pos, &dim) in self.order.iter().enumerate() {
                raw[dim] = points[pos][idx[pos]];
            }
            let config = reconstruct_config(&self.template, &self.leaves, &raw);
            match self.core.put(config, None, |_, _| {}) {
                Ok(()) => {}
                Err(e) if is_service_closed(&e) => return Ok(()),
                Err(e) => return Err(e),
            }

            if !advance(&mut idx, &self.allocations, &self.order) {
                return Ok(());
            }
        }
    }
}

/// Odometer increment: `true` if there is a next combination, `false` once
/// every dimension has wrapped back to zero (the grid is exhausted).
fn advance(idx: &mut [usize], allocations: &[u64], order: &[usize]) -> bool {
    for pos in (0..idx.len()).rev() {
        idx[pos] += 1;
        if (idx[pos] as u64) < allocations[order[pos]] {
            return true;
        }
        idx[pos] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunnerHooks;
    use crate::value::{quniform, uniform};

    #[test]
    fn unbounded_continuous_without_max_steps_fails() {
        let spaces = vec![Space::continuous(0.0, 1.0).unwrap()];
        assert!(matches!(allocate_counts(&spaces, None), Err(SpaceError::UnboundedContinuous)));
    }

    #[test]
    fn all_fixed_without_cap_enumerates_full_product() {
        let spaces = vec![Space::fixed(3).unwrap(), Space::fixed(4).unwrap()];
        let alloc = allocate_counts(&spaces, None).unwrap();
        assert_eq!(alloc, vec![3, 4]);
    }

    #[test]
    fn fixed_dimension_always_gets_full_cardinality() {
        let spaces = vec![Space::fixed(5).unwrap(), Space::continuous(0.0, 1.0).unwrap()];
        let alloc = allocate_counts(&spaces, Some(20)).unwrap();
        assert_eq!(alloc[0], 5);
        assert!(alloc[1] >= 1);
    }

    #[test]
    fn grid_session_emits_at_most_max_steps_tasks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hooks = RunnerHooks::for_test();
        let service = ThreadService::new(hooks, 2);
        service.start();

        let tpl = SpaceTemplate::Map(vec![
            ("x".to_string(), SpaceTemplate::Leaf(uniform(-10.0, 100.0).unwrap())),
            ("y".to_string(), SpaceTemplate::Leaf(quniform(-10.0, 20.0, 30.0).unwrap())),
        ]);
        let params = SessionParams { max_steps: Some(6), maximize: false };
        let session = GridAlgorithm::new().get_session(tpl, Arc::clone(&service), params).unwrap();
        session.clone().start();
        session.join();
        assert!(session.error().is_none());
        service.shutdown(true);
    }
}
