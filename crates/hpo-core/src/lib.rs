//! Parallel hyper-parameter search.
//!
//! - [`space`]: the leaf search-space primitives (`Continuous`, `Stepped`, `Fixed`)
//! - [`value`]: `HyperValue`, a space plus a composable chain of transforms
//! - [`template`]: structural composition of `HyperValue`s into a nested config tree
//! - [`expr`]: the result-expression DSL evaluated against `{config, return, metrics}`
//! - [`task`]: per-trial request/response types (`RunResult`, `RunFailed`, `RunSkipped`, `Skip`)
//! - [`rank`]: a bounded, stably-sorted top-K list
//! - [`service`]: a three-pool bounded worker service driving exec/callback/event hooks
//! - [`algorithm`]: the `Algorithm`/`Session` contract and the grid/random/bayes strategies
//! - [`runner`]: `ParallelSearchRunner`, the orchestration entry point

pub mod algorithm;
pub mod error;
pub mod expr;
pub mod rank;
pub mod runner;
pub mod service;
pub mod space;
pub mod task;
pub mod template;
pub mod value;

pub use error::{CoreError, ExprError, SpaceError};
pub use expr::Expr;
pub use rank::RankList;
pub use runner::{EvalError, EventSink, ParallelSearchRunner, RunnerError};
pub use space::Space;
pub use task::{RunFailed, RunResult, RunSkipped, Skip, Task};
pub use template::{ConfigValue, SpaceTemplate};
pub use value::HyperValue;
