//! Black-box coverage of the end-to-end scenarios from the search runner's
//! contract: seeded reproducibility, exact grid enumeration, unbounded
//! continuous-grid rejection, and skip/retry bookkeeping. Exercises only
//! `hpo_core`'s public API, the way a caller outside the crate would.

use hpo_core::algorithm::{BayesAlgorithm, GridAlgorithm, RandomAlgorithm};
use hpo_core::{ConfigValue, EvalError, Expr, ParallelSearchRunner, SpaceTemplate};

fn quadratic_space() -> SpaceTemplate {
    SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(hpo_core::value::uniform(-5.0, 5.0).unwrap()))])
}

fn eval_neg_square(cfg: &ConfigValue) -> Result<(ConfigValue, ConfigValue), EvalError> {
    let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
    Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
}

#[test]
fn two_seeded_random_runs_return_the_same_best_result() {
    let _ = env_logger::builder().is_test(true).try_init();

    let run = |seed: u64| {
        let runner = ParallelSearchRunner::new(RandomAlgorithm::new().seed(seed))
            .spaces(quadratic_space())
            .eval(eval_neg_square)
            .max_workers(1)
            .max_steps(25)
            .maximize(Expr::ret(), "neg_square")
            .rank(3);
        runner.run().unwrap().expect("at least one successful trial")
    };

    let (config_a, ret_a, _) = run(42);
    let (config_b, ret_b, _) = run(42);
    assert_eq!(config_a.to_json(), config_b.to_json());
    assert_eq!(ret_a.as_f64(), ret_b.as_f64());
}

#[test]
fn bounded_grid_enumerates_exactly_its_requested_sample_count() {
    let _ = env_logger::builder().is_test(true).try_init();

    let space = SpaceTemplate::Map(vec![(
        "x".to_string(),
        SpaceTemplate::Leaf(hpo_core::value::quniform(-5.0, 5.0, 1.0).unwrap()),
    )]);

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = std::sync::Arc::clone(&seen);
    let runner = ParallelSearchRunner::new(GridAlgorithm::new())
        .spaces(space)
        .eval(move |cfg| {
            let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
            seen_clone.lock().unwrap().push(x);
            Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
        })
        .max_workers(2)
        .max_steps(11)
        .maximize(Expr::ret(), "neg_square")
        .rank(1);

    let (config, ret, _) = runner.run().unwrap().expect("at least one successful trial");
    assert_eq!(config.get("x").and_then(ConfigValue::as_f64), Some(0.0));
    assert_eq!(ret.as_f64(), Some(0.0));

    let visited = seen.lock().unwrap();
    assert_eq!(visited.len(), 11, "an 11-point quniform dimension with max_steps 11 visits every point exactly once");
}

#[test]
fn unbounded_continuous_grid_is_rejected_up_front() {
    let _ = env_logger::builder().is_test(true).try_init();

    let space = SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(hpo_core::value::uniform(-5.0, 5.0).unwrap()))]);
    let runner = ParallelSearchRunner::new(GridAlgorithm::new())
        .spaces(space)
        .eval(eval_neg_square)
        .maximize(Expr::ret(), "neg_square");

    let err = runner.run().expect_err("a continuous dimension with no max_steps can't be enumerated");
    let msg = err.to_string();
    assert!(msg.to_lowercase().contains("unbounded") || msg.to_lowercase().contains("continuous"), "{msg}");
}

#[test]
fn retries_exhaust_before_giving_up_but_skips_do_not_count_against_them() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runner = ParallelSearchRunner::new(GridAlgorithm::new())
        .spaces(quadratic_space())
        .eval(|cfg| {
            let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
            if x < -4.0 {
                return Err(EvalError::Skip(ConfigValue::Null));
            }
            if x > 4.0 {
                return Err(EvalError::Failed("transient".into()));
            }
            Ok((ConfigValue::Float(-(x * x)), ConfigValue::Null))
        })
        .max_workers(2)
        .max_steps(11)
        .max_retries(0)
        .maximize(Expr::ret(), "neg_square")
        .rank(20);

    let best = runner.run().unwrap();
    assert!(best.is_some(), "failures/skips on some points don't prevent success on the rest of the grid");
}

#[test]
fn stop_when_halts_a_long_random_search_early() {
    let _ = env_logger::builder().is_test(true).try_init();

    let space = SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(hpo_core::value::uniform(-5.0, 5.0).unwrap()))]);
    let runner = ParallelSearchRunner::new(RandomAlgorithm::new().seed(7))
        .spaces(space)
        .eval(|cfg| {
            let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
            Ok((ConfigValue::Float(x), ConfigValue::Null))
        })
        .max_workers(1)
        .max_steps(100_000)
        .maximize(Expr::ret(), "x")
        .stop_when(Expr::ret().gt(Expr::Const(ConfigValue::Float(4.0))))
        .rank(1);

    let result = runner.run().unwrap();
    assert!(result.is_some());
}

#[test]
fn bayes_search_improves_on_a_simple_bowl() {
    let _ = env_logger::builder().is_test(true).try_init();

    let space = SpaceTemplate::Map(vec![("x".to_string(), SpaceTemplate::Leaf(hpo_core::value::uniform(-10.0, 10.0).unwrap()))]);
    let runner = ParallelSearchRunner::new(BayesAlgorithm::new().seed(3).init_steps(5))
        .spaces(space)
        .eval(|cfg| {
            let x = cfg.get("x").and_then(ConfigValue::as_f64).unwrap_or(0.0);
            Ok((ConfigValue::Float((x - 2.0).powi(2)), ConfigValue::Null))
        })
        .max_workers(1)
        .max_steps(20)
        .minimize(Expr::ret(), "loss")
        .rank(1);

    let (_, ret, _) = runner.run().unwrap().expect("at least one successful trial");
    assert!(ret.as_f64().unwrap() < 50.0, "bayes search should land somewhere inside the bowl, not at its edges");
}
