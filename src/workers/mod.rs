//! The operation-generating workers, one module per kind of operation.
//!
//! Every worker is created by a factory and driven by a
//! [`WorkerSession`](crate::run::WorkerSession) through `#[derive(Worker)]`.
//! A worker only implements a single step in its inherent
//! `execute` method.

pub mod aggregation;
pub mod insert;
pub mod read;
pub mod update;

use rand::Rng;

use crate::configuration::WorkerError;
use crate::partition::PickedKey;

pub type RngGen = rand_pcg::Pcg64Mcg;

pub(crate) fn new_rng() -> RngGen {
    RngGen::new(rand::thread_rng().gen())
}

// A key below the published mark of its insert worker must exist
pub(crate) fn missing_key(action: &str, picked: &PickedKey) -> WorkerError {
    WorkerError::InvariantViolation(format!(
        "{action} found no document with key {}, although insert worker {} has produced {} keys",
        picked.key, picked.worker_index, picked.highest_key_produced,
    ))
}
