//! Core traits, data model, and scheduler for medical image transform pipelines
//!
//! This crate provides the foundational components for building reproducible
//! preprocessing pipelines over volumetric (2D/3D/4D) channel-first images.
//! It defines the transform contract, keyed (dictionary) application, the
//! per-image ledger of deferred spatial operations, and the `Compose`
//! scheduler that sequences transforms, fuses lazy resampling and records
//! the provenance needed to invert a record's history.

#![warn(missing_docs)]

pub mod compose;
pub mod data;
pub mod error;
pub mod image;
pub mod lazy;
pub mod map;
pub mod matrix;
pub mod provenance;
pub mod random;
pub mod resample;
pub mod select;
pub mod stats;
pub mod transform;

// Re-export key types for convenience
pub use compose::{apply_transform, Compose, ComposeConfig, ExecuteOptions};
pub use data::{Data, Record, Value};
pub use error::{Error, Result};
pub use image::{ImageMeta, MetaImage};
pub use lazy::{apply_spatial, PendingLedger, PendingOp};
pub use map::{KeySelection, Keyed, Keys};
pub use provenance::{InverseRegistry, OpRecord};
pub use random::{RandGate, Randomizable, RandomState, Seed};
pub use resample::Interp;
pub use select::{OneOf, RandomOrder};
pub use stats::DataStats;
pub use transform::{
    Backend, CallOptions, Capabilities, LazyFlag, LazyTransform, Transform, TransformId,
};

/// Lazy resampling primitives
pub mod pending {
    pub use crate::lazy::{apply_spatial, flush, PendingLedger, PendingOp, LAZY_RESAMPLE_KIND};
    pub use crate::resample::{resample, Interp};
}

/// Pipeline configuration and execution
pub mod pipeline {
    pub use crate::compose::Compose;
    pub use crate::compose::ComposeConfig;
    pub use crate::compose::ExecuteOptions;
    pub use crate::select::OneOf;
    pub use crate::select::RandomOrder;
    pub use crate::select::{ONE_OF_KIND, RANDOM_ORDER_KIND};
}
