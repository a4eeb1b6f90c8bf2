//! Spatial, intensity and utility transforms for medpipe pipelines
//!
//! Spatial transforms are lazy-capable: inside a lazy [`Compose`] they append
//! to the image's pending ledger and are fused into as few resamplings as
//! possible. Every spatial transform records an invertible operation.
//!
//! [`Compose`]: medpipe_core::Compose

#![warn(missing_docs)]

pub mod dictionary;
pub mod intensity;
pub mod random;
pub mod spatial;
pub mod utility;

pub use intensity::{RandShiftIntensity, ScaleIntensity, ShiftIntensity};
pub use random::{RandAxisFlip, RandFlip, RandRotate90, RandSpatialCrop};
pub use spatial::{
    Affine, CenterSpatialCrop, CropRoi, Flip, PadMethod, RoiSlice, Rotate90, SpatialCrop,
    SpatialPad,
};
pub use utility::{CopyItems, DeleteItems, Identity, Lambda};
