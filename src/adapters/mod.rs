//! Illustrative, feature-gated adapters between the core dataflow graph and
//! the outside world. Kept out of the core crate surface on purpose — see
//! the module-level docs on each adapter for why.

#[cfg(feature = "csv-adapter")]
pub mod csv;
