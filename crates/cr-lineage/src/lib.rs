//! Per-lineage processing: decide whether action is needed, drive issuance,
//! deploy the result, and keep one lineage's failure away from the rest.

mod processor;

pub use processor::{Action, LineageProcessor, Outcome, ProcessError, RenewReason, Step, StepError};
