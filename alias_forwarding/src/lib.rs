#![deny(unsafe_op_in_unsafe_fn)]

//! Measures whether a store to one virtual address is speculatively forwarded
//! to a load from another address sharing its low 12 bits (4K aliasing), by
//! encoding the loaded byte into a flush+reload probe array.

pub mod alias;
pub mod attack;
pub mod config;
pub mod experiment;
pub mod report;
pub mod trial;

pub use alias::{setup_alias, AliasError, AliasedPair};
pub use attack::attack;
pub use config::{Delay, EvictionOrder, TrialConfig, DEFAULT_SECRETS};
pub use experiment::{run_experiment, ExperimentError, ExperimentSummary, Verdict, Warning};
pub use trial::{calibrate_threshold, run_trial, TrialOutcome, TrialStatus};
