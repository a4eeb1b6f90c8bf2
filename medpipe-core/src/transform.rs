//! Transform trait and capability flags
//!
//! A transform is a stateful or stateless unit of work over a [`Data`] record.
//! Rather than inspecting concrete types, the scheduler dispatches on the
//! [`Capabilities`] a transform declares and on its optional facets
//! ([`LazyTransform`], [`Randomizable`], [`KeySelection`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::Data;
use crate::error::{Error, Result};
use crate::map::KeySelection;
use crate::random::Randomizable;

/// Identity of a transform instance, stamped on the provenance it records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformId(Uuid);

impl TransformId {
    /// A fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransformId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric substrate a transform natively operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// CPU n-dimensional arrays
    Array,
    /// Device tensors
    Tensor,
}

/// What a transform can do, used by the scheduler in place of type checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Spatial operations can be deferred to the pending ledger
    pub lazy: bool,
    /// Draws randomness per call
    pub randomizable: bool,
    /// Operates on selected keys of a record
    pub map: bool,
    /// Records provenance that can be inverted
    pub invertible: bool,
    /// Holds mutable state that must not be shared between concurrent callers
    pub thread_unsafe: bool,
    /// Runs other transforms
    pub composite: bool,
}

impl Capabilities {
    /// No capabilities
    pub const NONE: Capabilities = Capabilities {
        lazy: false,
        randomizable: false,
        map: false,
        invertible: false,
        thread_unsafe: false,
        composite: false,
    };

    /// Set the lazy flag
    pub const fn with_lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Set the randomizable flag; random transforms are also thread-unsafe
    pub const fn with_random(mut self) -> Self {
        self.randomizable = true;
        self.thread_unsafe = true;
        self
    }

    /// Set the map flag
    pub const fn with_map(mut self) -> Self {
        self.map = true;
        self
    }

    /// Set the invertible flag
    pub const fn with_invertible(mut self) -> Self {
        self.invertible = true;
        self
    }

    /// Set the thread-unsafe flag
    pub const fn with_thread_unsafe(mut self) -> Self {
        self.thread_unsafe = true;
        self
    }

    /// Set the composite flag
    pub const fn with_composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Union of two capability sets
    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities {
            lazy: self.lazy || other.lazy,
            randomizable: self.randomizable || other.randomizable,
            map: self.map || other.map,
            invertible: self.invertible || other.invertible,
            thread_unsafe: self.thread_unsafe || other.thread_unsafe,
            composite: self.composite || other.composite,
        }
    }
}

/// Per-call options handed to [`Transform::call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Lazy override for lazy-capable transforms
    pub lazy: Option<bool>,
    /// Whether random transforms draw new factors before applying
    pub randomize: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            lazy: None,
            randomize: true,
        }
    }
}

impl CallOptions {
    /// Options with a lazy override
    pub fn lazy(lazy: bool) -> Self {
        Self {
            lazy: Some(lazy),
            ..Self::default()
        }
    }

    /// Reuse the random factors drawn by the last `randomize`
    pub fn without_randomize(mut self) -> Self {
        self.randomize = false;
        self
    }
}

/// A single pipeline stage.
///
/// Implementations receive ownership of the record and return the updated
/// record. Mutation of internal state goes through `&mut self`, so one
/// instance can never run for two callers at once; workers that run pipelines
/// in parallel each own their instances.
pub trait Transform: Send {
    /// Human-readable name used in logs and errors
    fn name(&self) -> &str;

    /// Apply the transform with explicit options
    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data>;

    /// Apply the transform with default options
    fn apply(&mut self, data: Data) -> Result<Data> {
        self.call(data, &CallOptions::default())
    }

    /// Apply the transform to the items of a tuple record spread as
    /// positional arguments. Transforms without a multi-argument form see the
    /// tuple itself.
    fn call_unpacked(&mut self, items: Vec<Data>, options: &CallOptions) -> Result<Data> {
        self.call(Data::Tuple(items), options)
    }

    /// Id stamped on the provenance this transform records
    fn id(&self) -> Option<TransformId> {
        None
    }

    /// Ids of this transform and any transforms it runs
    fn transform_ids(&self) -> Vec<TransformId> {
        self.id().into_iter().collect()
    }

    /// Substrates this transform operates on natively
    fn backends(&self) -> &'static [Backend] {
        &[]
    }

    /// Capability flags
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    /// The lazy facet, present on lazy-capable transforms
    fn as_lazy(&self) -> Option<&dyn LazyTransform> {
        None
    }

    /// Mutable lazy facet
    fn as_lazy_mut(&mut self) -> Option<&mut dyn LazyTransform> {
        None
    }

    /// The random facet, present on randomizable transforms
    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        None
    }

    /// Keys selected by a map transform
    fn key_selection(&self) -> Option<&KeySelection> {
        None
    }

    /// Post-call bookkeeping, invoked by the scheduler after every call
    fn sync_metadata(&self, _data: &mut Data) -> Result<()> {
        Ok(())
    }

    /// Undo this transform's last recorded operation
    fn inverse(&self, _data: Data) -> Result<Data> {
        Err(Error::Inversion(format!(
            "transform `{}` is not invertible",
            self.name()
        )))
    }

    /// Stages of a plain sequential composite
    fn as_sequence(&self) -> Option<&[Box<dyn Transform>]> {
        None
    }

    /// Give up the stages of a plain sequential composite so an enclosing
    /// composite can inline them
    fn take_sequence(&mut self) -> Option<Vec<Box<dyn Transform>>> {
        None
    }

    /// Give up the weighted branches of a selection composite so an
    /// enclosing selection can inline them
    fn take_choices(&mut self) -> Option<Vec<(Box<dyn Transform>, f64)>> {
        None
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
        (**self).call(data, options)
    }

    fn call_unpacked(&mut self, items: Vec<Data>, options: &CallOptions) -> Result<Data> {
        (**self).call_unpacked(items, options)
    }

    fn id(&self) -> Option<TransformId> {
        (**self).id()
    }

    fn transform_ids(&self) -> Vec<TransformId> {
        (**self).transform_ids()
    }

    fn backends(&self) -> &'static [Backend] {
        (**self).backends()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn as_lazy(&self) -> Option<&dyn LazyTransform> {
        (**self).as_lazy()
    }

    fn as_lazy_mut(&mut self) -> Option<&mut dyn LazyTransform> {
        (**self).as_lazy_mut()
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        (**self).as_randomizable()
    }

    fn key_selection(&self) -> Option<&KeySelection> {
        (**self).key_selection()
    }

    fn sync_metadata(&self, data: &mut Data) -> Result<()> {
        (**self).sync_metadata(data)
    }

    fn inverse(&self, data: Data) -> Result<Data> {
        (**self).inverse(data)
    }

    fn as_sequence(&self) -> Option<&[Box<dyn Transform>]> {
        (**self).as_sequence()
    }

    fn take_sequence(&mut self) -> Option<Vec<Box<dyn Transform>>> {
        (**self).take_sequence()
    }

    fn take_choices(&mut self) -> Option<Vec<(Box<dyn Transform>, f64)>> {
        (**self).take_choices()
    }
}

/// The tri-state lazy flag of a lazy-capable transform.
///
/// `Some(true)` always defers, `Some(false)` always materializes, `None`
/// follows the enclosing [`Compose`](crate::compose::Compose).
pub trait LazyTransform {
    /// Current setting
    fn lazy(&self) -> Option<bool>;

    /// Change the setting
    fn set_lazy(&mut self, lazy: Option<bool>);
}

/// A lazy setting parsed from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LazyFlag(pub Option<bool>);

impl TryFrom<&serde_json::Value> for LazyFlag {
    type Error = Error;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(LazyFlag(None)),
            serde_json::Value::Bool(b) => Ok(LazyFlag(Some(*b))),
            other => Err(Error::Type(format!(
                "lazy must be a bool or null but is {}",
                other
            ))),
        }
    }
}

impl From<LazyFlag> for Option<bool> {
    fn from(flag: LazyFlag) -> Self {
        flag.0
    }
}
