//! Record summaries for logging and failure diagnostics

use tracing::info;

use crate::data::{Data, Value};
use crate::error::Result;
use crate::image::MetaImage;
use crate::transform::{CallOptions, Transform};

/// Shape and value range of an image
pub fn describe_image(img: &MetaImage) -> String {
    let mut summary = format!("shape {:?}", img.array().shape());
    if let Some((lo, hi)) = img.value_range() {
        summary.push_str(&format!(", range ({}, {})", lo, hi));
    }
    if !img.pending().is_empty() {
        summary.push_str(&format!(", pending {:?}", img.pending().kinds()));
    }
    summary
}

/// Summary of one record entry: shape and range for images, the raw value
/// otherwise
pub fn describe_value(value: &Value) -> String {
    match value {
        Value::Image(img) => describe_image(img),
        Value::Scalar(v) => v.to_string(),
        Value::Text(s) => s.clone(),
        Value::Json(j) => j.to_string(),
    }
}

/// Per-field summaries of a record, keyed by field name. Records that are not
/// keyed are reported under `data`.
pub fn describe(data: &Data) -> Vec<(String, String)> {
    match data {
        Data::Image(img) => vec![("data".to_string(), describe_image(img))],
        Data::Record(record) => record
            .iter()
            .map(|(key, value)| (key.clone(), describe_value(value)))
            .collect(),
        Data::List(items) | Data::Tuple(items) => vec![(
            "data".to_string(),
            format!("{} with {} items", data.kind_name(), items.len()),
        )],
    }
}

/// Logs a summary of every record it sees and passes the record through
#[derive(Debug, Clone)]
pub struct DataStats {
    prefix: String,
    data_shape: bool,
    value_range: bool,
    data_value: bool,
}

impl Default for DataStats {
    fn default() -> Self {
        Self {
            prefix: "Data".to_string(),
            data_shape: true,
            value_range: true,
            data_value: false,
        }
    }
}

impl DataStats {
    /// Summaries prefixed with `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Include or omit image shapes
    pub fn data_shape(mut self, enabled: bool) -> Self {
        self.data_shape = enabled;
        self
    }

    /// Include or omit image value ranges
    pub fn value_range(mut self, enabled: bool) -> Self {
        self.value_range = enabled;
        self
    }

    /// Include the raw voxel values
    pub fn data_value(mut self, enabled: bool) -> Self {
        self.data_value = enabled;
        self
    }

    fn report(&self, field: &str, img: &MetaImage) {
        let shape = self.data_shape.then(|| format!("{:?}", img.array().shape()));
        let range = if self.value_range { img.value_range() } else { None };
        let values = self.data_value.then(|| format!("{}", img.array()));
        info!(
            target: "medpipe::stats",
            prefix = %self.prefix,
            field,
            shape = ?shape,
            range = ?range,
            values = ?values,
            operations = img.applied_operations().len(),
            "image statistics"
        );
    }
}

impl Transform for DataStats {
    fn name(&self) -> &str {
        "DataStats"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        match &data {
            Data::Record(record) => {
                for (key, value) in record {
                    match value {
                        Value::Image(img) => self.report(key, img),
                        other => info!(
                            target: "medpipe::stats",
                            prefix = %self.prefix,
                            field = %key,
                            value = %describe_value(other),
                            "value"
                        ),
                    }
                }
            }
            other => {
                let mut index = 0;
                other.for_each_image(&mut |img| {
                    self.report(&index.to_string(), img);
                    index += 1;
                });
            }
        }
        Ok(data)
    }
}
