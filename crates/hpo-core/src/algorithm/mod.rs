//! The algorithm/session contract plus the three concrete search strategies.

pub mod base;
pub mod bayes;
pub mod grid;
pub mod random;

pub use base::{reconstruct_config, is_service_closed, Algorithm, Session, SessionCore, SessionParams, SessionState};
pub use bayes::{Acquisition, BayesAlgorithm};
pub use grid::GridAlgorithm;
pub use random::RandomAlgorithm;
