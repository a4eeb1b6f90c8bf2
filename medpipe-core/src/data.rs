//! Records flowing through a pipeline

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::image::MetaImage;

/// A keyed record. Insertion order is kept so iteration is deterministic.
pub type Record = IndexMap<String, Value>;

/// One entry of a keyed record
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An image-like array with metadata
    Image(MetaImage),
    /// A numeric scalar
    Scalar(f64),
    /// A string, e.g. a source path or label name
    Text(String),
    /// Arbitrary auxiliary metadata
    Json(serde_json::Value),
}

impl Value {
    /// The image, if this value is one
    pub fn as_image(&self) -> Option<&MetaImage> {
        match self {
            Value::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Mutable image, if this value is one
    pub fn as_image_mut(&mut self) -> Option<&mut MetaImage> {
        match self {
            Value::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Image(_) => "image",
            Value::Scalar(_) => "scalar",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
        }
    }
}

impl From<MetaImage> for Value {
    fn from(img: MetaImage) -> Self {
        Value::Image(img)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// The unit processed by a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// A bare image
    Image(MetaImage),
    /// A keyed record
    Record(Record),
    /// Independent records, e.g. several crops of one volume
    List(Vec<Data>),
    /// Records that travel together, optionally spread as positional arguments
    Tuple(Vec<Data>),
}

impl Data {
    /// Build a keyed record from `(key, value)` pairs
    pub fn record<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Data::Record(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short name of the variant, used in diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Data::Image(_) => "image",
            Data::Record(_) => "record",
            Data::List(_) => "list",
            Data::Tuple(_) => "tuple",
        }
    }

    /// Whether this is a list or tuple
    pub fn is_sequence(&self) -> bool {
        matches!(self, Data::List(_) | Data::Tuple(_))
    }

    /// The image, if this is a bare image
    pub fn as_image(&self) -> Option<&MetaImage> {
        match self {
            Data::Image(img) => Some(img),
            _ => None,
        }
    }

    /// The record, if this is a keyed record
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Data::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Mutable record, if this is a keyed record
    pub fn as_record_mut(&mut self) -> Option<&mut Record> {
        match self {
            Data::Record(r) => Some(r),
            _ => None,
        }
    }

    /// The items, if this is a list or tuple
    pub fn as_items(&self) -> Option<&[Data]> {
        match self {
            Data::List(items) | Data::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Take the bare image; `transform` names the caller in the error
    pub fn into_image(self, transform: &str) -> Result<MetaImage> {
        match self {
            Data::Image(img) => Ok(img),
            other => Err(Error::Type(format!(
                "transform `{}` expects an image but got a {}",
                transform,
                other.kind_name()
            ))),
        }
    }

    /// Take the keyed record; `transform` names the caller in the error
    pub fn into_record(self, transform: &str) -> Result<Record> {
        match self {
            Data::Record(r) => Ok(r),
            other => Err(Error::Type(format!(
                "transform `{}` expects a keyed record but got a {}",
                transform,
                other.kind_name()
            ))),
        }
    }

    /// Visit every image in this record, depth first in iteration order
    pub fn for_each_image_mut<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&mut MetaImage) -> Result<()>,
    {
        match self {
            Data::Image(img) => f(img),
            Data::Record(record) => {
                for value in record.values_mut() {
                    if let Value::Image(img) = value {
                        f(img)?;
                    }
                }
                Ok(())
            }
            Data::List(items) | Data::Tuple(items) => {
                for item in items {
                    item.for_each_image_mut(f)?;
                }
                Ok(())
            }
        }
    }

    /// Visit every image in this record
    pub fn for_each_image<F>(&self, f: &mut F)
    where
        F: FnMut(&MetaImage),
    {
        match self {
            Data::Image(img) => f(img),
            Data::Record(record) => {
                for value in record.values() {
                    if let Value::Image(img) = value {
                        f(img);
                    }
                }
            }
            Data::List(items) | Data::Tuple(items) => {
                for item in items {
                    item.for_each_image(f);
                }
            }
        }
    }

    /// Number of deferred operations across all images
    pub fn pending_count(&self) -> usize {
        let mut count = 0;
        self.for_each_image(&mut |img| count += img.pending().len());
        count
    }

    /// Materialize the pending operations of every image
    pub fn apply_pending(&mut self) -> Result<()> {
        self.for_each_image_mut(&mut |img| img.apply_pending())
    }

    /// First image in iteration order, used by transforms that draw random
    /// factors from a representative shape
    pub fn first_image(&self) -> Option<&MetaImage> {
        match self {
            Data::Image(img) => Some(img),
            Data::Record(record) => record.values().find_map(Value::as_image),
            Data::List(items) | Data::Tuple(items) => items.iter().find_map(Data::first_image),
        }
    }
}

impl From<MetaImage> for Data {
    fn from(img: MetaImage) -> Self {
        Data::Image(img)
    }
}

impl From<Record> for Data {
    fn from(record: Record) -> Self {
        Data::Record(record)
    }
}
