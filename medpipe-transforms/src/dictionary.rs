//! Keyed forms of the image transforms, applied to named entries of a record
//!
//! Every alias wraps the array transform of the same name in [`Keyed`]:
//!
//! ```ignore
//! let mut flip = Flipd::new(["image", "label"], Flip::axis(0))?;
//! ```

use medpipe_core::Keyed;

use crate::intensity::{RandShiftIntensity, ScaleIntensity, ShiftIntensity};
use crate::random::{RandAxisFlip, RandFlip, RandRotate90, RandSpatialCrop};
use crate::spatial::{Affine, CenterSpatialCrop, Flip, Rotate90, SpatialCrop, SpatialPad};
use crate::utility::{CopyItems, DeleteItems, Identity};

/// Flip named images
pub type Flipd = Keyed<Flip>;
/// Quarter-turn named images
pub type Rotate90d = Keyed<Rotate90>;
/// Crop named images to a fixed region
pub type SpatialCropd = Keyed<SpatialCrop>;
/// Centre crop named images
pub type CenterSpatialCropd = Keyed<CenterSpatialCrop>;
/// Pad named images
pub type SpatialPadd = Keyed<SpatialPad>;
/// Affine-resample named images
pub type Affined = Keyed<Affine>;

/// Flip named images with one shared draw
pub type RandFlipd = Keyed<RandFlip>;
/// Flip one random axis of named images, the same axis for every key
pub type RandAxisFlipd = Keyed<RandAxisFlip>;
/// Random quarter turns of named images with one shared draw
pub type RandRotate90d = Keyed<RandRotate90>;
/// Crop the same random region from every named image
pub type RandSpatialCropd = Keyed<RandSpatialCrop>;

/// Shift intensities of named images
pub type ShiftIntensityd = Keyed<ShiftIntensity>;
/// Rescale intensities of named images
pub type ScaleIntensityd = Keyed<ScaleIntensity>;
/// Shift named images by one shared random offset
pub type RandShiftIntensityd = Keyed<RandShiftIntensity>;

/// Pass named entries through
pub type Identityd = Keyed<Identity>;

/// Already keyed; aliased for naming symmetry
pub type CopyItemsd = CopyItems;
/// Already keyed; aliased for naming symmetry
pub type DeleteItemsd = DeleteItems;
