// src/delta/mod.rs

//! Binary-diff (delta) updates
//!
//! A delta bundle carries one `DELTA` section: a payload describing
//! block-level transformations from the running slot's partitions to the
//! new ones. The payload engine itself is an external collaborator; this
//! module stages the payload, estimates the work for progress reporting,
//! and drives the engine against the target slot.
//!
//! # Architecture
//!
//! - **PayloadEngine / DeltaPayload**: open a staged payload and apply it
//! - **Estimate**: operation counts and the download/apply progress split
//! - **DeltaApplier**: extraction, application and failure handling

mod applier;
mod estimate;
mod payload;

pub use applier::DeltaApplier;
pub use estimate::{ApplyPlan, DOWNLOAD_SHARE_DENOMINATOR, download_units, operation_estimate};
pub use payload::{
    ApplyTargets, DeltaPayload, ExternalPayloadEngine, PayloadEngine, PayloadError,
    PayloadObserver, PayloadSummary,
};
