//! Command line conventions borrowed from Go's standard library, so that
//! the bencher accepts the same flags and values as Go tools do.

pub mod flags;
pub mod strconv;
