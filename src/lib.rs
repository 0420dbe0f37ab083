#[macro_use]
extern crate async_trait;

#[cfg(test)]
pub(crate) mod test_util;

pub mod configuration;
pub mod election;
pub mod harness;
pub mod partition;
pub mod record;
pub mod report;
pub mod run;
pub mod sample;
pub mod stats;
pub mod store;
pub mod version;
pub mod workers;
