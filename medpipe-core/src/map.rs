//! Keyed application of transforms across fields of a record

use serde_json::Value as Json;

use crate::data::{Data, Record, Value};
use crate::error::{Error, Result};
use crate::random::Randomizable;
use crate::transform::{
    Backend, CallOptions, Capabilities, LazyTransform, Transform, TransformId,
};

/// An ordered list of record keys. A single key becomes a one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Keys(Vec<String>);

impl Keys {
    /// The keys in order
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Keys {
    fn from(key: &str) -> Self {
        Keys(vec![key.to_string()])
    }
}

impl From<String> for Keys {
    fn from(key: String) -> Self {
        Keys(vec![key])
    }
}

impl From<Vec<String>> for Keys {
    fn from(keys: Vec<String>) -> Self {
        Keys(keys)
    }
}

impl From<Vec<&str>> for Keys {
    fn from(keys: Vec<&str>) -> Self {
        Keys(keys.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Keys {
    fn from(keys: &[&str]) -> Self {
        Keys(keys.iter().map(|k| (*k).to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Keys {
    fn from(keys: [&str; N]) -> Self {
        Keys(keys.iter().map(|k| (*k).to_string()).collect())
    }
}

impl TryFrom<&Json> for Keys {
    type Error = Error;

    fn try_from(value: &Json) -> Result<Self> {
        match value {
            Json::String(key) => Ok(Keys(vec![key.clone()])),
            Json::Array(items) => items
                .iter()
                .map(|item| match item {
                    Json::String(key) => Ok(key.clone()),
                    other => Err(Error::Type(format!("keys must be strings, got {}", other))),
                })
                .collect::<Result<Vec<_>>>()
                .map(Keys),
            other => Err(Error::Type(format!(
                "keys must be a string or a list of strings, got {}",
                other
            ))),
        }
    }
}

/// The keys a map transform operates on and its missing-key policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelection {
    keys: Vec<String>,
    allow_missing_keys: bool,
}

impl KeySelection {
    /// Select `keys`, which must not be empty
    pub fn new(keys: impl Into<Keys>, allow_missing_keys: bool) -> Result<Self> {
        let keys = keys.into().0;
        if keys.is_empty() {
            return Err(Error::Value("keys must be non empty".into()));
        }
        Ok(Self {
            keys,
            allow_missing_keys,
        })
    }

    /// The selected keys, in order
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Whether absent keys are skipped instead of failing the call
    pub fn allow_missing_keys(&self) -> bool {
        self.allow_missing_keys
    }

    /// Change the missing-key policy
    pub fn set_allow_missing_keys(&mut self, allow: bool) {
        self.allow_missing_keys = allow;
    }

    fn check<'a>(&self, key: &'a str, record: &Record, transform: &str) -> Option<Result<&'a str>> {
        if record.contains_key(key) {
            Some(Ok(key))
        } else if self.allow_missing_keys {
            None
        } else {
            Some(Err(Error::MissingKey {
                key: key.to_string(),
                transform: transform.to_string(),
            }))
        }
    }

    /// Selected keys present in `record`.
    ///
    /// Absent keys are skipped when allowed, otherwise they yield
    /// [`Error::MissingKey`] naming `transform`. The iterator is lazy and can
    /// be cloned to restart it.
    pub fn key_iterator<'a>(
        &'a self,
        record: &'a Record,
        transform: &'a str,
    ) -> impl Iterator<Item = Result<&'a str>> + Clone + 'a {
        self.keys
            .iter()
            .filter_map(move |key| self.check(key, record, transform))
    }

    /// Like [`KeySelection::key_iterator`], pairing each key with the entry of
    /// `extras` at the same position. `extras` must have one entry per key.
    pub fn key_iterator_with<'a, E>(
        &'a self,
        record: &'a Record,
        extras: &'a [E],
        transform: &'a str,
    ) -> Result<impl Iterator<Item = Result<(&'a str, &'a E)>> + Clone + 'a> {
        if extras.len() != self.keys.len() {
            return Err(Error::Value(format!(
                "`{}` got {} extra values for {} keys",
                transform,
                extras.len(),
                self.keys.len()
            )));
        }
        Ok(self.keys.iter().zip(extras).filter_map(move |(key, extra)| {
            self.check(key, record, transform)
                .map(|checked| checked.map(|key| (key, extra)))
        }))
    }

    /// The first selected key present in `record`, if any
    pub fn first_key<'a>(&'a self, record: &'a Record, transform: &'a str) -> Result<Option<&'a str>> {
        self.key_iterator(record, transform).next().transpose()
    }
}

/// Broadcasts an image transform across selected keys of a record.
///
/// A random inner transform is randomized once per call, from the first
/// present key, and every key receives the same decision.
pub struct Keyed<T> {
    inner: T,
    selection: KeySelection,
    name: String,
}

impl<T: Transform> Keyed<T> {
    /// Apply `inner` to `keys`; every key must be present
    pub fn new(keys: impl Into<Keys>, inner: T) -> Result<Self> {
        let selection = KeySelection::new(keys, false)?;
        let name = format!("{}d", inner.name());
        Ok(Self {
            inner,
            selection,
            name,
        })
    }

    /// Skip absent keys instead of failing
    pub fn allow_missing_keys(mut self, allow: bool) -> Self {
        self.selection.set_allow_missing_keys(allow);
        self
    }

    /// The wrapped transform
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Mutable access to the wrapped transform
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    fn present_keys(&self, record: &Record) -> Result<Vec<String>> {
        self.selection
            .key_iterator(record, &self.name)
            .map(|key| key.map(str::to_string))
            .collect()
    }

    fn take_image(&self, record: &mut Record, key: &str) -> Result<Data> {
        let Some(slot) = record.get_mut(key) else {
            return Err(Error::MissingKey {
                key: key.to_string(),
                transform: self.name.clone(),
            });
        };
        match std::mem::replace(slot, Value::Json(Json::Null)) {
            Value::Image(img) => Ok(Data::Image(img)),
            other => {
                let kind = other.kind_name();
                *slot = other;
                Err(Error::Type(format!(
                    "`{}` expects an image at key `{}` but found a {}",
                    self.name, key, kind
                )))
            }
        }
    }

    fn put_image(&self, record: &mut Record, key: &str, data: Data) -> Result<()> {
        let img = data.into_image(&self.name)?;
        record.insert(key.to_string(), Value::Image(img));
        Ok(())
    }
}

impl<T: Transform> Transform for Keyed<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
        let mut record = data.into_record(&self.name)?;

        if options.randomize && self.inner.capabilities().randomizable {
            let sample = match self.selection.first_key(&record, &self.name)? {
                Some(key) => match &record[key] {
                    Value::Image(img) => Data::Image(img.clone()),
                    other => {
                        return Err(Error::Type(format!(
                            "`{}` expects an image at key `{}` but found a {}",
                            self.name,
                            key,
                            other.kind_name()
                        )))
                    }
                },
                None => return Ok(Data::Record(record)),
            };
            if let Some(random) = self.inner.as_randomizable() {
                random.randomize(&sample)?;
            }
        }

        let inner_options = options.without_randomize();
        for key in self.present_keys(&record)? {
            let data = self.take_image(&mut record, &key)?;
            let out = self.inner.call(data, &inner_options)?;
            self.put_image(&mut record, &key, out)?;
        }
        Ok(Data::Record(record))
    }

    fn id(&self) -> Option<TransformId> {
        self.inner.id()
    }

    fn transform_ids(&self) -> Vec<TransformId> {
        self.inner.transform_ids()
    }

    fn backends(&self) -> &'static [Backend] {
        self.inner.backends()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities().with_map()
    }

    fn as_lazy(&self) -> Option<&dyn LazyTransform> {
        self.inner.as_lazy()
    }

    fn as_lazy_mut(&mut self) -> Option<&mut dyn LazyTransform> {
        self.inner.as_lazy_mut()
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        self.inner.as_randomizable()
    }

    fn key_selection(&self) -> Option<&KeySelection> {
        Some(&self.selection)
    }

    fn sync_metadata(&self, data: &mut Data) -> Result<()> {
        let Some(record) = data.as_record_mut() else {
            return Ok(());
        };
        for key in &self.selection.keys {
            let (meta, ops) = match record.get(key) {
                Some(Value::Image(img)) => (
                    serde_json::to_value(img.meta())?,
                    serde_json::to_value(img.applied_operations())?,
                ),
                _ => continue,
            };
            if let Some(slot) = record.get_mut(&format!("{}_meta_dict", key)) {
                *slot = Value::Json(meta);
            }
            if let Some(slot) = record.get_mut(&format!("{}_transforms", key)) {
                *slot = Value::Json(ops);
            }
        }
        Ok(())
    }

    fn inverse(&self, data: Data) -> Result<Data> {
        let mut record = data.into_record(&self.name)?;
        for key in self.present_keys(&record)?.iter().rev() {
            let data = self.take_image(&mut record, key)?;
            let out = self.inner.inverse(data)?;
            self.put_image(&mut record, key, out)?;
        }
        Ok(Data::Record(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MetaImage;
    use ndarray::array;
    use serde_json::json;

    fn image(offset: f32) -> MetaImage {
        MetaImage::new(array![[[offset, offset + 1.0]]].into_dyn()).unwrap()
    }

    struct AddOne;

    impl Transform for AddOne {
        fn name(&self) -> &str {
            "AddOne"
        }

        fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
            let mut img = data.into_image(self.name())?;
            img.array_mut().mapv_inplace(|v| v + 1.0);
            Ok(Data::Image(img))
        }
    }

    fn record() -> Record {
        Data::record([("a", image(0.0)), ("b", image(10.0))])
            .into_record("test")
            .unwrap()
    }

    #[test]
    fn test_keys_flatten() {
        assert_eq!(Keys::from("a").as_slice(), &["a".to_string()][..]);
        assert_eq!(Keys::from(["a", "b"]).len(), 2);
        assert_eq!(Keys::try_from(&json!(["a", "b"])).unwrap(), Keys::from(["a", "b"]));
        assert!(matches!(Keys::try_from(&json!([1])), Err(Error::Type(_))));
        assert!(matches!(Keys::try_from(&json!({"a": 1})), Err(Error::Type(_))));
    }

    #[test]
    fn test_empty_keys_rejected() {
        let err = KeySelection::new(Vec::<String>::new(), false).unwrap_err();
        assert!(matches!(err, Error::Value(_)));
    }

    #[test]
    fn test_missing_key_policy() {
        let record = record();
        let strict = KeySelection::new(["a", "c", "b"], false).unwrap();
        let keys: Result<Vec<_>> = strict.key_iterator(&record, "T").collect();
        match keys.unwrap_err() {
            Error::MissingKey { key, transform } => {
                assert_eq!(key, "c");
                assert_eq!(transform, "T");
            }
            other => panic!("unexpected error {other}"),
        }

        let lenient = KeySelection::new(["a", "c", "b"], true).unwrap();
        let iter = lenient.key_iterator(&record, "T");
        let first: Vec<_> = iter.clone().collect::<Result<_>>().unwrap();
        let again: Vec<_> = iter.collect::<Result<_>>().unwrap();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, again);
    }

    #[test]
    fn test_key_iterator_with_extras() {
        let record = record();
        let selection = KeySelection::new(["a", "c", "b"], true).unwrap();
        let pairs: Vec<_> = selection
            .key_iterator_with(&record, &[1, 2, 3], "T")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(pairs, vec![("a", &1), ("b", &3)]);
        assert!(matches!(
            selection.key_iterator_with(&record, &[1], "T"),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_first_key() {
        let record = record();
        let selection = KeySelection::new(["z", "b"], true).unwrap();
        assert_eq!(selection.first_key(&record, "T").unwrap(), Some("b"));
        let none = KeySelection::new(["z"], true).unwrap();
        assert_eq!(none.first_key(&record, "T").unwrap(), None);
    }

    #[test]
    fn test_keyed_applies_to_selected_keys() {
        let mut t = Keyed::new(["a"], AddOne).unwrap();
        assert_eq!(t.name(), "AddOned");
        assert!(t.capabilities().map);

        let out = t.apply(Data::Record(record())).unwrap();
        let out = out.as_record().unwrap();
        assert_eq!(out["a"].as_image().unwrap().array()[[0, 0, 0]], 1.0);
        assert_eq!(out["b"].as_image().unwrap().array()[[0, 0, 0]], 10.0);
    }

    #[test]
    fn test_keyed_rejects_non_image() {
        let mut t = Keyed::new("label", AddOne).unwrap();
        let data = Data::record([("label", Value::from(3.0))]);
        let err = t.apply(data).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn test_sync_metadata_refreshes_meta_dict() {
        let t = Keyed::new("a", AddOne).unwrap();
        let mut data = Data::record([
            ("a", Value::from(image(0.0).with_source("a.nii"))),
            ("a_meta_dict", Value::from(json!({}))),
        ]);
        t.sync_metadata(&mut data).unwrap();
        match &data.as_record().unwrap()["a_meta_dict"] {
            Value::Json(meta) => assert_eq!(meta["source"], "a.nii"),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
