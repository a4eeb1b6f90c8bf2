//! Composites that choose which stages run, and in what order

use serde_json::json;

use crate::compose::{apply_transform, collect_ids, inherited_capabilities, reseed_children, ComposeConfig};
use crate::data::Data;
use crate::error::{Error, Result};
use crate::image::MetaImage;
use crate::provenance::OpRecord;
use crate::random::{Randomizable, RandomState, Seed};
use crate::transform::{CallOptions, Capabilities, Transform, TransformId};

/// Kind of the marker recording which branch a [`OneOf`] took
pub const ONE_OF_KIND: &str = "OneOf";

/// Kind of the marker recording the order a [`RandomOrder`] drew
pub const RANDOM_ORDER_KIND: &str = "RandomOrder";

fn push_marker(data: &mut Data, marker: &OpRecord) -> Result<()> {
    data.for_each_image_mut(&mut |img| {
        img.push_applied(marker.clone());
        Ok(())
    })
}

/// Parameters of the newest marker `owner` left on the first image
fn find_marker(data: &Data, owner: TransformId, kind: &str) -> Option<serde_json::Value> {
    data.first_image().and_then(|img| {
        img.applied_operations()
            .iter()
            .rev()
            .find(|op| op.kind == kind && op.transform_ids == [owner])
            .map(|op| op.params.clone())
    })
}

fn pop_marker(img: &mut MetaImage, owner: TransformId, kind: &str) -> Result<()> {
    match img.last_applied() {
        Some(op) if op.kind == kind && op.transform_ids == [owner] => {
            img.pop_applied();
            Ok(())
        }
        Some(op) => Err(Error::Inversion(format!(
            "expected the `{}` marker on top of the provenance, found `{}`",
            kind, op.kind
        ))),
        None => Err(Error::Inversion(format!("the `{}` marker is missing", kind))),
    }
}

fn normalize(weights: &[f64], count: usize) -> Result<Vec<f64>> {
    if weights.len() != count {
        return Err(Error::Value(format!(
            "transforms and weights should be same size if both specified as sequences, got {} and {}",
            count,
            weights.len()
        )));
    }
    if weights.iter().any(|w| *w < 0.0 || w.is_nan()) {
        return Err(Error::Value(format!("weights must be non-negative, got {:?}", weights)));
    }
    let total: f64 = weights.iter().sum();
    if count > 0 && total <= 0.0 {
        return Err(Error::Value("at least one weight must be greater than zero".into()));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Runs exactly one of its stages per call, drawn according to per-stage
/// weights, and records the branch taken so inversion replays it
pub struct OneOf {
    transforms: Vec<Box<dyn Transform>>,
    weights: Vec<f64>,
    config: ComposeConfig,
    id: TransformId,
    state: RandomState,
    selected: Option<usize>,
}

impl OneOf {
    /// Choose uniformly among `transforms`
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        let count = transforms.len();
        let weights = vec![1.0 / count.max(1) as f64; count];
        Self::build(transforms, weights)
    }

    /// Choose according to `weights`, normalized to sum to one
    pub fn with_weights(transforms: Vec<Box<dyn Transform>>, weights: Vec<f64>) -> Result<Self> {
        let weights = normalize(&weights, transforms.len())?;
        Ok(Self::build(transforms, weights))
    }

    fn build(transforms: Vec<Box<dyn Transform>>, weights: Vec<f64>) -> Self {
        Self {
            transforms,
            weights,
            config: ComposeConfig::default(),
            id: TransformId::new(),
            state: RandomState::new(),
            selected: None,
        }
    }

    /// Replace the configuration used to run the chosen stage
    pub fn with_config(mut self, config: ComposeConfig) -> Self {
        self.config = config;
        self
    }

    /// The stages
    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        &self.transforms
    }

    /// Normalized weights
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Index of the stage chosen by the last draw
    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    /// Inline nested selections, multiplying their weights by the weight of
    /// the branch they occupy
    pub fn flatten(mut self) -> Self {
        let mut transforms = Vec::with_capacity(self.transforms.len());
        let mut weights = Vec::with_capacity(self.weights.len());
        let branches = std::mem::take(&mut self.transforms);
        for (mut transform, weight) in branches.into_iter().zip(self.weights.iter().copied()) {
            match transform.take_choices() {
                Some(choices) => {
                    let (inner, inner_weights): (Vec<_>, Vec<_>) = choices.into_iter().unzip();
                    let nested = OneOf::build(inner, inner_weights).flatten();
                    transforms.extend(nested.transforms);
                    weights.extend(nested.weights.iter().map(|w| w * weight));
                }
                None => {
                    transforms.push(transform);
                    weights.push(weight);
                }
            }
        }
        self.transforms = transforms;
        self.weights = weights;
        self.selected = None;
        self
    }
}

impl Transform for OneOf {
    fn name(&self) -> &str {
        "OneOf"
    }

    fn call(&mut self, mut data: Data, options: &CallOptions) -> Result<Data> {
        if self.transforms.is_empty() {
            return Ok(data);
        }
        if options.randomize || self.selected.is_none() {
            self.randomize(&data)?;
        }
        let index = self.selected.unwrap_or(0);

        push_marker(&mut data, &OpRecord::marker(ONE_OF_KIND, self.id, json!({ "index": index })))?;

        let mut config = self.config.clone();
        config.lazy = options.lazy.or(config.lazy);
        apply_transform(self.transforms[index].as_mut(), data, None, &config)
    }

    fn id(&self) -> Option<TransformId> {
        Some(self.id)
    }

    fn transform_ids(&self) -> Vec<TransformId> {
        collect_ids(self.id, &self.transforms)
    }

    fn capabilities(&self) -> Capabilities {
        inherited_capabilities(&self.transforms).with_random()
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        Some(self)
    }

    /// Undo the branch recorded by the last call, then the marker
    fn inverse(&self, mut data: Data) -> Result<Data> {
        data.apply_pending()?;
        let Some(params) = find_marker(&data, self.id, ONE_OF_KIND) else {
            return Err(Error::Inversion("no OneOf marker found to invert".into()));
        };
        let index = params["index"]
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .filter(|i| *i < self.transforms.len())
            .ok_or_else(|| Error::Inversion(format!("invalid OneOf marker {}", params)))?;

        let mut data = self.transforms[index].inverse(data)?;
        data.for_each_image_mut(&mut |img| pop_marker(img, self.id, ONE_OF_KIND))?;
        Ok(data)
    }

    fn take_choices(&mut self) -> Option<Vec<(Box<dyn Transform>, f64)>> {
        let transforms = std::mem::take(&mut self.transforms);
        let weights = std::mem::take(&mut self.weights);
        Some(transforms.into_iter().zip(weights).collect())
    }
}

impl Randomizable for OneOf {
    fn random_state_mut(&mut self) -> &mut RandomState {
        &mut self.state
    }

    fn set_random_state(&mut self, seed: Option<Seed>, state: Option<RandomState>) -> Result<()> {
        self.state = RandomState::resolve(seed, state)?;
        reseed_children(&mut self.state, &mut self.transforms)
    }

    fn randomize(&mut self, _data: &Data) -> Result<()> {
        self.selected = Some(self.state.choose_weighted(&self.weights));
        Ok(())
    }
}

/// Runs all of its stages in a freshly drawn order
pub struct RandomOrder {
    transforms: Vec<Box<dyn Transform>>,
    config: ComposeConfig,
    id: TransformId,
    state: RandomState,
    order: Vec<usize>,
}

impl RandomOrder {
    /// Shuffle `transforms` on every call
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self {
            transforms,
            config: ComposeConfig::default(),
            id: TransformId::new(),
            state: RandomState::new(),
            order: Vec::new(),
        }
    }

    /// Replace the configuration used to run the stages
    pub fn with_config(mut self, config: ComposeConfig) -> Self {
        self.config = config;
        self
    }

    /// The order drawn by the last call
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl Transform for RandomOrder {
    fn name(&self) -> &str {
        "RandomOrder"
    }

    fn call(&mut self, mut data: Data, options: &CallOptions) -> Result<Data> {
        if self.transforms.is_empty() {
            return Ok(data);
        }
        if options.randomize || self.order.len() != self.transforms.len() {
            self.randomize(&data)?;
        }

        push_marker(&mut data, &OpRecord::marker(RANDOM_ORDER_KIND, self.id, json!({ "order": self.order })))?;

        let mut config = self.config.clone();
        config.lazy = options.lazy.or(config.lazy);
        for &index in &self.order {
            data = apply_transform(self.transforms[index].as_mut(), data, None, &config)?;
        }
        Ok(data)
    }

    fn id(&self) -> Option<TransformId> {
        Some(self.id)
    }

    fn transform_ids(&self) -> Vec<TransformId> {
        collect_ids(self.id, &self.transforms)
    }

    fn capabilities(&self) -> Capabilities {
        inherited_capabilities(&self.transforms).with_random()
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        Some(self)
    }

    /// Undo the stages in the reverse of the recorded order, then the marker
    fn inverse(&self, mut data: Data) -> Result<Data> {
        data.apply_pending()?;
        let Some(params) = find_marker(&data, self.id, RANDOM_ORDER_KIND) else {
            return Err(Error::Inversion("no RandomOrder marker found to invert".into()));
        };
        let order: Vec<usize> = serde_json::from_value(params["order"].clone())?;
        if order.iter().any(|&i| i >= self.transforms.len()) {
            return Err(Error::Inversion(format!("invalid RandomOrder marker {}", params)));
        }

        for &index in order.iter().rev() {
            data = self.transforms[index].inverse(data)?;
        }
        data.for_each_image_mut(&mut |img| pop_marker(img, self.id, RANDOM_ORDER_KIND))?;
        Ok(data)
    }
}

impl Randomizable for RandomOrder {
    fn random_state_mut(&mut self) -> &mut RandomState {
        &mut self.state
    }

    fn set_random_state(&mut self, seed: Option<Seed>, state: Option<RandomState>) -> Result<()> {
        self.state = RandomState::resolve(seed, state)?;
        reseed_children(&mut self.state, &mut self.transforms)
    }

    fn randomize(&mut self, _data: &Data) -> Result<()> {
        self.order = (0..self.transforms.len()).collect();
        self.state.shuffle(&mut self.order);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts its calls and tags the image's first voxel
    struct Tag {
        value: f32,
        calls: Arc<AtomicUsize>,
    }

    impl Tag {
        fn boxed(value: f32) -> (Box<dyn Transform>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Tag {
                    value,
                    calls: calls.clone(),
                }),
                calls,
            )
        }
    }

    impl Transform for Tag {
        fn name(&self) -> &str {
            "Tag"
        }

        fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut img = data.into_image(self.name())?;
            img.array_mut()[[0, 0]] = self.value;
            Ok(Data::Image(img))
        }

        fn inverse(&self, data: Data) -> Result<Data> {
            Ok(data)
        }
    }

    fn image() -> Data {
        Data::Image(MetaImage::new(array![[0.0f32, 0.0]].into_dyn()).unwrap())
    }

    #[test]
    fn test_weights_validated() {
        let (a, _) = Tag::boxed(1.0);
        assert!(matches!(OneOf::with_weights(vec![a], vec![1.0, 2.0]), Err(Error::Value(_))));
        let (a, _) = Tag::boxed(1.0);
        assert!(matches!(OneOf::with_weights(vec![a], vec![-1.0]), Err(Error::Value(_))));
        let (a, _) = Tag::boxed(1.0);
        assert!(matches!(OneOf::with_weights(vec![a], vec![0.0]), Err(Error::Value(_))));
    }

    #[test]
    fn test_single_branch_with_degenerate_weights() {
        let (a, calls_a) = Tag::boxed(1.0);
        let (b, calls_b) = Tag::boxed(2.0);
        let (c, calls_c) = Tag::boxed(3.0);
        let mut one_of = OneOf::with_weights(vec![a, b, c], vec![1.0, 0.0, 0.0])
            .unwrap()
            .seeded(0u64);

        for _ in 0..50 {
            let out = one_of.apply(image()).unwrap();
            let img = out.as_image().unwrap();
            assert_eq!(img.array()[[0, 0]], 1.0);
            assert_eq!(img.last_applied().unwrap().params["index"], 0);
        }
        assert_eq!(calls_a.load(Ordering::SeqCst), 50);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);
        assert_eq!(calls_c.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_replays_selection_without_randomize() {
        let (a, _) = Tag::boxed(1.0);
        let (b, _) = Tag::boxed(2.0);
        let mut one_of = OneOf::new(vec![a, b]).seeded(5u64);
        let first = one_of.apply(image()).unwrap();
        let chosen = one_of.selected().unwrap();
        for _ in 0..10 {
            let again = one_of
                .call(image(), &CallOptions::default().without_randomize())
                .unwrap();
            assert_eq!(again, first);
            assert_eq!(one_of.selected(), Some(chosen));
        }
    }

    #[test]
    fn test_flatten_multiplies_weights() {
        let (a, _) = Tag::boxed(1.0);
        let (b, _) = Tag::boxed(2.0);
        let (c, _) = Tag::boxed(3.0);
        let inner = OneOf::with_weights(vec![b, c], vec![1.0, 3.0]).unwrap();
        let outer = OneOf::with_weights(vec![a, Box::new(inner)], vec![1.0, 1.0])
            .unwrap()
            .flatten();
        assert_eq!(outer.transforms().len(), 3);
        assert_eq!(outer.weights(), &[0.5, 0.125, 0.375][..]);
    }

    #[test]
    fn test_inverse_pops_marker() {
        let (a, _) = Tag::boxed(1.0);
        let mut one_of = OneOf::new(vec![a]);
        let out = one_of.apply(image()).unwrap();
        let back = one_of.inverse(out).unwrap();
        assert!(back.as_image().unwrap().applied_operations().is_empty());
    }

    #[test]
    fn test_random_order_runs_everything() {
        let (a, calls_a) = Tag::boxed(1.0);
        let (b, calls_b) = Tag::boxed(2.0);
        let mut order = RandomOrder::new(vec![a, b]).seeded(11u64);
        let out = order.apply(image()).unwrap();
        let mut drawn = order.order().to_vec();
        let last = drawn[1];
        assert_eq!(out.as_image().unwrap().array()[[0, 0]], [1.0, 2.0][last]);
        drawn.sort_unstable();
        assert_eq!(drawn, vec![0, 1]);
        assert_eq!(calls_a.load(Ordering::SeqCst) + calls_b.load(Ordering::SeqCst), 2);

        let back = order.inverse(out).unwrap();
        assert!(back.as_image().unwrap().applied_operations().is_empty());
    }

    #[test]
    fn test_marker_reaches_every_image() {
        let (a, _) = Tag::boxed(1.0);
        let mut one_of = OneOf::new(vec![a]).with_config(ComposeConfig {
            map_items: true,
            ..ComposeConfig::default()
        });
        let out = one_of.apply(Data::List(vec![image(), image()])).unwrap();
        let mut markers = 0;
        out.for_each_image(&mut |img| markers += img.applied_operations().len());
        assert_eq!(markers, 2);
    }
}
