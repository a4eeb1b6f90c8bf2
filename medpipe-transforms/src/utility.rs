//! Pass-through, callback and record bookkeeping transforms

use std::collections::HashSet;
use std::fmt;

use medpipe_core::{
    Backend, CallOptions, Capabilities, Data, Error, KeySelection, Keys, Result, Transform,
};
use tracing::debug;

/// Returns its input unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn name(&self) -> &str {
        "Identity"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        Ok(data)
    }

    fn backends(&self) -> &'static [Backend] {
        &[Backend::Array, Backend::Tensor]
    }

    fn inverse(&self, data: Data) -> Result<Data> {
        Ok(data)
    }
}

type LambdaFn = Box<dyn FnMut(Data) -> Result<Data> + Send>;
type InverseLambdaFn = Box<dyn Fn(Data) -> Result<Data> + Send>;

/// Runs a user callback, optionally paired with its inverse.
///
/// The callback may hold state, so the transform is not safe to share.
pub struct Lambda {
    name: String,
    func: LambdaFn,
    inverse: Option<InverseLambdaFn>,
}

impl Lambda {
    /// Wrap `func` under `name`
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut(Data) -> Result<Data> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            inverse: None,
        }
    }

    /// Undo with `inverse`
    pub fn with_inverse<F>(mut self, inverse: F) -> Self
    where
        F: Fn(Data) -> Result<Data> + Send + 'static,
    {
        self.inverse = Some(Box::new(inverse));
        self
    }
}

impl fmt::Debug for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lambda")
            .field("name", &self.name)
            .field("invertible", &self.inverse.is_some())
            .finish_non_exhaustive()
    }
}

impl Transform for Lambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        (self.func)(data)
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::NONE.with_thread_unsafe();
        if self.inverse.is_some() {
            caps.with_invertible()
        } else {
            caps
        }
    }

    fn inverse(&self, data: Data) -> Result<Data> {
        match &self.inverse {
            Some(inverse) => inverse(data),
            None => Err(Error::Inversion(format!(
                "lambda `{}` has no inverse",
                self.name
            ))),
        }
    }
}

/// Copies selected entries of a record under new names.
///
/// Each key is copied `times` times. `names` holds `keys.len() * times`
/// entries; copy `i` of key `k` is stored under `names[i * keys.len() + k]`.
/// Image copies share their buffer until either side is written.
#[derive(Debug, Clone)]
pub struct CopyItems {
    selection: KeySelection,
    times: usize,
    names: Vec<Vec<String>>,
}

impl CopyItems {
    /// Copy `keys` `times` times under `names`
    pub fn new(keys: impl Into<Keys>, times: usize, names: impl Into<Keys>) -> Result<Self> {
        let selection = KeySelection::new(keys, false)?;
        if times < 1 {
            return Err(Error::Value(format!(
                "times must be at least 1, got {}",
                times
            )));
        }
        let names: Keys = names.into();
        let count = selection.keys().len();
        if names.len() != count * times {
            return Err(Error::Value(format!(
                "expected {} names for {} keys copied {} times, got {}",
                count * times,
                count,
                times,
                names.len()
            )));
        }

        let mut seen = HashSet::with_capacity(names.len());
        if let Some(duplicate) = names.as_slice().iter().find(|name| !seen.insert(name.as_str())) {
            return Err(Error::Value(format!(
                "copy name {} is given more than once",
                duplicate
            )));
        }

        let mut per_key = vec![Vec::with_capacity(times); count];
        for (index, name) in names.as_slice().iter().enumerate() {
            per_key[index % count].push(name.clone());
        }
        Ok(Self {
            selection,
            times,
            names: per_key,
        })
    }

    /// Skip absent keys instead of failing
    pub fn allow_missing_keys(mut self, allow: bool) -> Self {
        self.selection.set_allow_missing_keys(allow);
        self
    }

    /// Number of copies per key
    pub fn times(&self) -> usize {
        self.times
    }
}

impl Transform for CopyItems {
    fn name(&self) -> &str {
        "CopyItems"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        let mut record = data.into_record("CopyItems")?;

        let mut copies = Vec::new();
        for entry in self
            .selection
            .key_iterator_with(&record, &self.names, "CopyItems")?
        {
            let (key, names) = entry?;
            for name in names {
                if record.contains_key(name) {
                    return Err(Error::Value(format!(
                        "Key {} already exists in data",
                        name
                    )));
                }
                copies.push((name.clone(), record[key].clone()));
            }
        }

        debug!(target: "medpipe::transforms", copies = copies.len(), "copying items");
        record.extend(copies);
        Ok(Data::Record(record))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with_map()
    }

    fn key_selection(&self) -> Option<&KeySelection> {
        Some(&self.selection)
    }
}

/// Removes selected entries from a record; absent keys are ignored
#[derive(Debug, Clone)]
pub struct DeleteItems {
    selection: KeySelection,
}

impl DeleteItems {
    /// Remove `keys`
    pub fn new(keys: impl Into<Keys>) -> Result<Self> {
        Ok(Self {
            selection: KeySelection::new(keys, true)?,
        })
    }
}

impl Transform for DeleteItems {
    fn name(&self) -> &str {
        "DeleteItems"
    }

    fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
        let mut record = data.into_record("DeleteItems")?;
        for key in self.selection.keys() {
            record.shift_remove(key);
        }
        Ok(Data::Record(record))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE.with_map()
    }

    fn key_selection(&self) -> Option<&KeySelection> {
        Some(&self.selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medpipe_core::{MetaImage, Value};
    use ndarray::array;

    fn record() -> Data {
        let img = MetaImage::new(array![[1.0f32, 2.0]].into_dyn()).unwrap();
        Data::record([("img", Value::from(img)), ("label", Value::from(1.0))])
    }

    #[test]
    fn test_copy_name_layout() {
        let mut copy = CopyItems::new(vec!["img", "label"], 2, vec!["i0", "l0", "i1", "l1"]).unwrap();
        let out = copy.apply(record()).unwrap();
        let record = out.as_record().unwrap();
        let keys: Vec<_> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["img", "label", "i0", "i1", "l0", "l1"]);
        assert_eq!(record["l1"], Value::Scalar(1.0));
        assert!(record["i0"].as_image().is_some());
    }

    #[test]
    fn test_copy_rejects_bad_arguments() {
        assert!(matches!(CopyItems::new("img", 0, Vec::<String>::new()), Err(Error::Value(_))));
        assert!(matches!(CopyItems::new("img", 2, "copy"), Err(Error::Value(_))));
        assert!(matches!(
            CopyItems::new(vec!["img", "label"], 1, vec!["copy", "copy"]),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_copy_refuses_to_overwrite() {
        let mut copy = CopyItems::new("img", 1, "label").unwrap();
        let err = copy.apply(record()).unwrap_err();
        assert_eq!(err.to_string(), "Value error: Key label already exists in data");
    }

    #[test]
    fn test_delete_ignores_missing() {
        let mut delete = DeleteItems::new(vec!["label", "absent"]).unwrap();
        let out = delete.apply(record()).unwrap();
        assert_eq!(out.as_record().unwrap().len(), 1);
    }

    #[test]
    fn test_lambda_inverse() {
        let mut double = Lambda::new("double", |data| Ok(Data::List(vec![data.clone(), data])))
            .with_inverse(|data| match data {
                Data::List(mut items) => items.pop().ok_or_else(|| Error::Value("empty".into())),
                other => Ok(other),
            });
        assert!(double.capabilities().invertible);
        let out = double.apply(record()).unwrap();
        assert_eq!(double.inverse(out).unwrap(), record());

        let plain = Lambda::new("noop", Ok);
        assert!(matches!(plain.inverse(record()), Err(Error::Inversion(_))));
    }
}
