//! Pipeline sequencing, lazy flush points and failure reporting

use std::env;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::data::Data;
use crate::error::{Error, Result};
use crate::provenance::InverseRegistry;
use crate::random::{Randomizable, RandomState, Seed};
use crate::stats;
use crate::transform::{CallOptions, Capabilities, LazyFlag, Transform, TransformId};

/// Environment variable that turns on debug mode for every pipeline
pub const DEBUG_ENV: &str = "MEDPIPE_DEBUG";

/// Configuration for a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Run the pipeline on each element of a list or tuple record
    pub map_items: bool,

    /// Spread tuple records as positional arguments
    pub unpack_items: bool,

    /// Lazy default for lazy-capable stages without their own setting
    pub lazy: Option<bool>,

    /// Log per-field diagnostics when a stage fails
    pub log_stats: bool,

    /// Propagate stage failures unwrapped
    pub debug: bool,

    /// Still log diagnostics in debug mode
    pub log_diagnostics_in_debug: bool,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            map_items: true,
            unpack_items: false,
            lazy: Some(false),
            log_stats: true,
            debug: false,
            log_diagnostics_in_debug: false,
        }
    }
}

impl ComposeConfig {
    /// Parse a configuration from JSON, validating the lazy setting
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        if let Some(lazy) = value.get("lazy") {
            LazyFlag::try_from(lazy)?;
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Whether failures propagate unwrapped, from this config or the environment
    pub fn debug_enabled(&self) -> bool {
        self.debug || env::var(DEBUG_ENV).is_ok_and(|v| env_flag(&v))
    }

    fn logs_diagnostics(&self, composite: bool) -> bool {
        let wanted = if self.debug_enabled() {
            self.log_diagnostics_in_debug
        } else {
            self.log_stats
        };
        wanted && !composite && tracing::enabled!(target: "medpipe::compose", tracing::Level::ERROR)
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Options for a single pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Index of the first stage to run
    pub start: usize,

    /// One past the last stage to run; all remaining stages when unset
    pub end: Option<usize>,

    /// Lazy override for every lazy-capable stage
    pub lazy: Option<bool>,

    /// Materialize deferred operations before returning
    pub flush: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            lazy: None,
            flush: true,
        }
    }
}

impl ExecuteOptions {
    /// Run stages `start..end`
    pub fn range(start: usize, end: usize) -> Self {
        Self {
            start,
            end: Some(end),
            ..Self::default()
        }
    }

    /// Override the lazy setting of every lazy-capable stage
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = Some(lazy);
        self
    }

    /// Leave deferred operations pending on the output
    pub fn without_flush(mut self) -> Self {
        self.flush = false;
        self
    }
}

/// Apply one stage the way a pipeline does.
///
/// List and tuple records are mapped element-wise when `config.map_items` is
/// set. `lazy` overrides the stage's own lazy setting; `config.lazy` is the
/// fallback. Pending operations are flushed first unless the stage will defer.
/// Failures are logged and wrapped with the stage name unless debug mode is on.
pub fn apply_transform(
    transform: &mut dyn Transform,
    data: Data,
    lazy: Option<bool>,
    config: &ComposeConfig,
) -> Result<Data> {
    match data {
        Data::List(items) | Data::Tuple(items) if config.map_items => items
            .into_iter()
            .map(|item| apply_transform(transform, item, lazy, config))
            .collect::<Result<Vec<_>>>()
            .map(Data::List),
        data => apply_one(transform, data, lazy, config),
    }
}

fn resolve_lazy(transform: &dyn Transform, lazy: Option<bool>, config: &ComposeConfig) -> Option<bool> {
    let caps = transform.capabilities();
    if caps.composite {
        lazy.or(config.lazy)
    } else if caps.lazy {
        let own = transform.as_lazy().and_then(|own| own.lazy());
        Some(lazy.or(own).or(config.lazy).unwrap_or(false))
    } else {
        None
    }
}

fn apply_one(
    transform: &mut dyn Transform,
    mut data: Data,
    lazy: Option<bool>,
    config: &ComposeConfig,
) -> Result<Data> {
    let call_lazy = resolve_lazy(transform, lazy, config);
    let composite = transform.capabilities().composite;

    if !composite && call_lazy != Some(true) {
        data.apply_pending()?;
    }
    log_pending(transform, &data, call_lazy);

    // no clone of the input may outlive this point: a second Arc makes array_mut copy
    let diagnostics = config
        .logs_diagnostics(composite)
        .then(|| stats::describe(diagnostic_input(&data)));
    let options = CallOptions {
        lazy: call_lazy,
        randomize: true,
    };
    let result = match data {
        Data::Tuple(items) if config.unpack_items => transform.call_unpacked(items, &options),
        data => transform.call(data, &options),
    }
    .and_then(|mut out| {
        transform.sync_metadata(&mut out)?;
        Ok(out)
    });

    result.map_err(|err| report_failure(transform.name(), diagnostics, err, config))
}

/// Lists are summarised by their first element
fn diagnostic_input(data: &Data) -> &Data {
    match data {
        Data::List(items) | Data::Tuple(items) => items.first().unwrap_or(data),
        data => data,
    }
}

fn log_pending(transform: &dyn Transform, data: &Data, lazy: Option<bool>) {
    if !tracing::enabled!(target: "medpipe::compose", tracing::Level::DEBUG) {
        return;
    }
    match (transform.key_selection(), data) {
        (Some(selection), Data::Record(record)) => {
            for key in selection.keys() {
                if let Some(img) = record.get(key).and_then(|v| v.as_image()) {
                    debug!(
                        target: "medpipe::compose",
                        transform = transform.name(),
                        key = %key,
                        lazy = ?lazy,
                        pending = ?img.pending().kinds(),
                        "applying"
                    );
                }
            }
        }
        _ => debug!(
            target: "medpipe::compose",
            transform = transform.name(),
            lazy = ?lazy,
            pending = data.pending_count(),
            "applying"
        ),
    }
}

fn report_failure(
    name: &str,
    diagnostics: Option<Vec<(String, String)>>,
    err: Error,
    config: &ComposeConfig,
) -> Error {
    if let Some(fields) = diagnostics {
        error!(target: "medpipe::compose", transform = name, "\n=== Transform input info -- {} ===", name);
        for (field, summary) in fields {
            error!(target: "medpipe::compose", transform = name, field = %field, "{}", summary);
        }
    }
    if config.debug_enabled() {
        err
    } else {
        err.in_transform(name)
    }
}

/// Draw a fresh seed from `state` for every randomizable stage
pub(crate) fn reseed_children(state: &mut RandomState, transforms: &mut [Box<dyn Transform>]) -> Result<()> {
    for transform in transforms {
        if let Some(random) = transform.as_randomizable() {
            random.set_random_state(Some(Seed::Int(state.next_seed())), None)?;
        }
    }
    Ok(())
}

/// Capabilities a composite inherits from the stages it runs
pub(crate) fn inherited_capabilities(transforms: &[Box<dyn Transform>]) -> Capabilities {
    transforms
        .iter()
        .map(|t| t.capabilities())
        .fold(Capabilities::NONE.with_composite(), |acc, caps| Capabilities {
            randomizable: acc.randomizable || caps.randomizable,
            thread_unsafe: acc.thread_unsafe || caps.thread_unsafe,
            invertible: acc.invertible || caps.invertible,
            ..acc
        })
}

/// Ids recorded by `transforms` and everything they run
pub(crate) fn collect_ids(own: TransformId, transforms: &[Box<dyn Transform>]) -> Vec<TransformId> {
    let mut ids = vec![own];
    for transform in transforms {
        ids.extend(transform.transform_ids());
    }
    ids
}

fn flattened_len(transforms: &[Box<dyn Transform>]) -> usize {
    transforms
        .iter()
        .map(|t| t.as_sequence().map_or(1, flattened_len))
        .sum()
}

/// An ordered pipeline of transforms.
///
/// Lazy-capable stages may defer their spatial operations; the ledger is
/// flushed before any stage that needs materialized data and at the end of
/// the pipeline, so successive spatial operations resample once.
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
    config: ComposeConfig,
    id: TransformId,
    state: RandomState,
    registry: Option<Arc<InverseRegistry>>,
}

impl Compose {
    /// A pipeline with the default configuration
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self::with_config(transforms, ComposeConfig::default())
    }

    /// A pipeline with an explicit configuration
    pub fn with_config(transforms: Vec<Box<dyn Transform>>, config: ComposeConfig) -> Self {
        Self {
            transforms,
            config,
            id: TransformId::new(),
            state: RandomState::new(),
            registry: None,
        }
    }

    /// Append a stage
    pub fn then<T: Transform + 'static>(mut self, transform: T) -> Self {
        self.transforms.push(Box::new(transform));
        self
    }

    /// Append a boxed stage
    pub fn push(&mut self, transform: Box<dyn Transform>) {
        self.transforms.push(transform);
    }

    /// Set the lazy default
    pub fn lazy(mut self, lazy: Option<bool>) -> Self {
        self.config.lazy = lazy;
        self
    }

    /// Set element-wise application of list records
    pub fn map_items(mut self, map_items: bool) -> Self {
        self.config.map_items = map_items;
        self
    }

    /// Set positional spreading of tuple records
    pub fn unpack_items(mut self, unpack_items: bool) -> Self {
        self.config.unpack_items = unpack_items;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Use `registry` instead of the global one when inverting
    pub fn with_registry(mut self, registry: InverseRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// The configuration
    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// The stages, in order
    pub fn transforms(&self) -> &[Box<dyn Transform>] {
        &self.transforms
    }

    /// Number of stages once nested pipelines are inlined
    pub fn len(&self) -> usize {
        flattened_len(&self.transforms)
    }

    /// Whether the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first stage matching `predicate`, e.g. the first random
    /// stage, before which results can be cached
    pub fn index_of_first<P>(&self, predicate: P) -> Option<usize>
    where
        P: Fn(&dyn Transform) -> bool,
    {
        self.transforms.iter().position(|t| predicate(t.as_ref()))
    }

    /// Inline nested plain pipelines
    pub fn flatten(mut self) -> Self {
        let mut flat = Vec::with_capacity(self.transforms.len());
        for mut transform in std::mem::take(&mut self.transforms) {
            match transform.take_sequence() {
                Some(stages) => flat.extend(Compose::new(stages).flatten().transforms),
                None => flat.push(transform),
            }
        }
        self.transforms = flat;
        self
    }

    /// Run the pipeline
    pub fn execute(&mut self, data: Data, options: ExecuteOptions) -> Result<Data> {
        let config = self.config.clone();
        self.run(data, options, &config)
    }

    fn run(&mut self, data: Data, options: ExecuteOptions, config: &ComposeConfig) -> Result<Data> {
        let end = options.end.unwrap_or(self.transforms.len());
        if options.start > end || end > self.transforms.len() {
            return Err(Error::Value(format!(
                "cannot run stages {}..{} of a pipeline with {} stages",
                options.start,
                end,
                self.transforms.len()
            )));
        }
        if options.start == end {
            return Ok(data);
        }

        let mut out = run_chain(&mut self.transforms[options.start..end], data, options.lazy, config)?;
        if options.flush {
            out.apply_pending()?;
        }
        Ok(out)
    }

    fn registry(&self) -> &InverseRegistry {
        match &self.registry {
            Some(registry) => registry.as_ref(),
            None => InverseRegistry::global(),
        }
    }
}

fn run_chain(
    transforms: &mut [Box<dyn Transform>],
    mut data: Data,
    lazy: Option<bool>,
    config: &ComposeConfig,
) -> Result<Data> {
    for index in 0..transforms.len() {
        data = match data {
            Data::List(items) | Data::Tuple(items) if config.map_items => {
                let rest = &mut transforms[index..];
                return items
                    .into_iter()
                    .map(|item| run_chain(rest, item, lazy, config))
                    .collect::<Result<Vec<_>>>()
                    .map(Data::List);
            }
            data => apply_one(transforms[index].as_mut(), data, lazy, config)?,
        };
    }
    Ok(data)
}

impl Transform for Compose {
    fn name(&self) -> &str {
        "Compose"
    }

    /// A nested pipeline takes the enclosing lazy setting as its default and
    /// always flushes at its end.
    fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
        let mut config = self.config.clone();
        config.lazy = options.lazy.or(config.lazy);
        self.run(data, ExecuteOptions::default(), &config)
    }

    fn id(&self) -> Option<TransformId> {
        Some(self.id)
    }

    fn transform_ids(&self) -> Vec<TransformId> {
        collect_ids(self.id, &self.transforms)
    }

    fn capabilities(&self) -> Capabilities {
        inherited_capabilities(&self.transforms)
    }

    fn as_randomizable(&mut self) -> Option<&mut dyn Randomizable> {
        Some(self)
    }

    /// Undo, newest first, every operation this pipeline recorded
    fn inverse(&self, mut data: Data) -> Result<Data> {
        let owners = self.transform_ids();
        let registry = self.registry();
        data.for_each_image_mut(&mut |img| registry.invert_owned(img, &owners).map(|_| ()))?;
        Ok(data)
    }

    fn as_sequence(&self) -> Option<&[Box<dyn Transform>]> {
        Some(&self.transforms)
    }

    fn take_sequence(&mut self) -> Option<Vec<Box<dyn Transform>>> {
        Some(std::mem::take(&mut self.transforms))
    }
}

impl Randomizable for Compose {
    fn random_state_mut(&mut self) -> &mut RandomState {
        &mut self.state
    }

    fn set_random_state(&mut self, seed: Option<Seed>, state: Option<RandomState>) -> Result<()> {
        self.state = RandomState::resolve(seed, state)?;
        reseed_children(&mut self.state, &mut self.transforms)
    }

    /// Stages draw their own factors when they run
    fn randomize(&mut self, _data: &Data) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::image::MetaImage;
    use crate::lazy::{apply_spatial, PendingOp};
    use crate::matrix;
    use crate::transform::LazyTransform;
    use ndarray::array;
    use serde_json::json;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use test_case::test_case;

    fn image() -> Data {
        Data::Image(MetaImage::new(array![[[1.0f32, 2.0], [3.0, 4.0]]].into_dyn()).unwrap())
    }

    struct Scale(f32);

    impl Transform for Scale {
        fn name(&self) -> &str {
            "Scale"
        }

        fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
            let mut img = data.into_image(self.name())?;
            img.array_mut().mapv_inplace(|v| v * self.0);
            Ok(Data::Image(img))
        }
    }

    struct Fail;

    impl Transform for Fail {
        fn name(&self) -> &str {
            "Fail"
        }

        fn call(&mut self, _data: Data, _options: &CallOptions) -> Result<Data> {
            Err(Error::Value("boom".into()))
        }
    }

    /// Lazy-capable flip of the first spatial axis that reports what it saw
    struct Mirror {
        id: TransformId,
        lazy: Option<bool>,
        seen_pending: Arc<AtomicUsize>,
    }

    impl Mirror {
        fn new(lazy: Option<bool>) -> Self {
            Self {
                id: TransformId::new(),
                lazy,
                seen_pending: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl LazyTransform for Mirror {
        fn lazy(&self) -> Option<bool> {
            self.lazy
        }

        fn set_lazy(&mut self, lazy: Option<bool>) {
            self.lazy = lazy;
        }
    }

    impl Transform for Mirror {
        fn name(&self) -> &str {
            "Mirror"
        }

        fn call(&mut self, data: Data, options: &CallOptions) -> Result<Data> {
            let lazy = options.lazy.or(self.lazy).unwrap_or(false);
            let mut img = data.into_image(self.name())?;
            self.seen_pending.store(img.pending().len(), Ordering::SeqCst);
            let shape = img.peek_pending_shape();
            let op = PendingOp::new("Mirror", self.id, matrix::flip(&shape, &[0])?, shape);
            apply_spatial(&mut img, op, lazy)?;
            Ok(Data::Image(img))
        }

        fn id(&self) -> Option<TransformId> {
            Some(self.id)
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::NONE.with_lazy().with_invertible()
        }

        fn as_lazy(&self) -> Option<&dyn LazyTransform> {
            Some(self)
        }

        fn inverse(&self, data: Data) -> Result<Data> {
            let mut img = data.into_image(self.name())?;
            InverseRegistry::global().invert_last(&mut img, self.id, self.name())?;
            Ok(Data::Image(img))
        }
    }

    #[test]
    fn test_nested_matches_flat() {
        let mut nested = Compose::new(vec![
            Box::new(Compose::new(vec![Box::new(Scale(2.0)), Box::new(Scale(3.0))])),
            Box::new(Scale(0.5)),
        ]);
        let mut flat = Compose::new(vec![Box::new(Scale(2.0)), Box::new(Scale(3.0)), Box::new(Scale(0.5))]);
        assert_eq!(nested.len(), 3);
        assert_eq!(
            nested.apply(image()).unwrap(),
            flat.apply(image()).unwrap()
        );

        let flattened = nested.flatten();
        assert_eq!(flattened.transforms().len(), 3);
    }

    #[test]
    fn test_map_items_runs_whole_chain_per_item() {
        let mut pipeline = Compose::new(vec![Box::new(Scale(2.0))]);
        let out = pipeline.apply(Data::List(vec![image(), image()])).unwrap();
        let items = out.as_items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].as_image().unwrap().array()[[0, 1, 1]], 8.0);
    }

    #[test]
    fn test_failure_is_wrapped() {
        let mut pipeline = Compose::new(vec![Box::new(Scale(2.0)), Box::new(Fail)]);
        let err = pipeline.apply(image()).unwrap_err();
        match &err {
            Error::Transform { transform, .. } => assert_eq!(transform, "Fail"),
            other => panic!("unexpected error {other}"),
        }
        assert!(matches!(err.root_cause(), Error::Value(_)));
    }

    #[test]
    fn test_debug_propagates_raw_error() {
        let mut pipeline = Compose::new(vec![Box::new(Fail)]).debug(true);
        let err = pipeline.apply(image()).unwrap_err();
        assert!(matches!(err, Error::Value(_)));
    }

    #[test]
    fn test_lazy_stages_defer_until_end() {
        let second = Mirror::new(None);
        let seen = second.seen_pending.clone();
        let mut pipeline = Compose::new(vec![Box::new(Mirror::new(None)), Box::new(second)]).lazy(Some(true));

        let out = pipeline.apply(image()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let img = out.as_image().unwrap();
        assert!(img.pending().is_empty());
        assert_eq!(img.applied_operations().len(), 1);
        assert_eq!(img.array(), image().as_image().unwrap().array());
    }

    #[test]
    fn test_eager_stage_forces_flush() {
        let eager = Mirror::new(Some(false));
        let seen = eager.seen_pending.clone();
        let mut pipeline = Compose::new(vec![Box::new(Mirror::new(None)), Box::new(eager)]).lazy(Some(true));
        pipeline.apply(image()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_override_beats_own_flag() {
        let eager = Mirror::new(Some(false));
        let seen = eager.seen_pending.clone();
        let mut pipeline = Compose::new(vec![Box::new(Mirror::new(Some(false))), Box::new(eager)]);
        let out = pipeline
            .execute(image(), ExecuteOptions::default().lazy(true).without_flush())
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(out.pending_count(), 2);
    }

    #[test]
    fn test_partial_execution() {
        let mut pipeline = Compose::new(vec![Box::new(Scale(2.0)), Box::new(Scale(10.0))]);
        let out = pipeline.execute(image(), ExecuteOptions::range(1, 2)).unwrap();
        assert_eq!(out.as_image().unwrap().array()[[0, 0, 0]], 10.0);
        assert_eq!(pipeline.execute(image(), ExecuteOptions::range(1, 1)).unwrap(), image());
        assert!(matches!(
            pipeline.execute(image(), ExecuteOptions::range(1, 3)),
            Err(Error::Value(_))
        ));
    }

    #[test]
    fn test_inverse_undoes_owned_operations() {
        let mut pipeline = Compose::new(vec![Box::new(Mirror::new(None)), Box::new(Mirror::new(None))]);
        let mut input = image();
        if let Data::Image(img) = &mut input {
            img.push_applied(crate::provenance::OpRecord::marker("Load", TransformId::new(), json!(null)));
        }
        let out = pipeline.apply(input.clone()).unwrap();
        assert_eq!(out.as_image().unwrap().applied_operations().len(), 3);

        let back = pipeline.inverse(out).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_index_of_first() {
        let pipeline = Compose::new(vec![Box::new(Scale(1.0)), Box::new(Mirror::new(None))]);
        assert_eq!(pipeline.index_of_first(|t| t.capabilities().lazy), Some(1));
        assert_eq!(pipeline.index_of_first(|t| t.capabilities().randomizable), None);
    }

    #[test]
    fn test_config_from_json() {
        let config = ComposeConfig::from_json(&json!({"lazy": null, "map_items": false})).unwrap();
        assert_eq!(config.lazy, None);
        assert!(!config.map_items);
        assert!(config.log_stats);
        assert!(matches!(
            ComposeConfig::from_json(&json!({"lazy": "yes"})),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_record_diagnostics_do_not_alter_error() {
        let mut pipeline = Compose::new(vec![Box::new(Fail)]);
        let data = Data::record([("label", Value::from(1.0))]);
        let err = pipeline.apply(data).unwrap_err();
        assert_eq!(err.to_string(), "applying transform Fail");
    }

    /// Reports how many positional items it received; zero for a plain call
    struct Spread {
        received: Arc<AtomicUsize>,
    }

    impl Transform for Spread {
        fn name(&self) -> &str {
            "Spread"
        }

        fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
            self.received.store(0, Ordering::SeqCst);
            Ok(data)
        }

        fn call_unpacked(&mut self, items: Vec<Data>, _options: &CallOptions) -> Result<Data> {
            self.received.store(items.len(), Ordering::SeqCst);
            Ok(Data::Tuple(items))
        }
    }

    #[test]
    fn test_unpack_items_spreads_tuples() {
        for (unpack, expected) in [(true, 2), (false, 0)] {
            let received = Arc::new(AtomicUsize::new(usize::MAX));
            let mut pipeline = Compose::new(vec![Box::new(Spread {
                received: received.clone(),
            })])
            .map_items(false)
            .unpack_items(unpack);
            let out = pipeline.apply(Data::Tuple(vec![image(), image()])).unwrap();
            assert_eq!(received.load(Ordering::SeqCst), expected);
            assert_eq!(out, Data::Tuple(vec![image(), image()]));
        }
    }

    /// Records whether writing the buffer reused it
    struct Touch {
        in_place: Arc<AtomicUsize>,
    }

    impl Transform for Touch {
        fn name(&self) -> &str {
            "Touch"
        }

        fn call(&mut self, data: Data, _options: &CallOptions) -> Result<Data> {
            let mut img = data.into_image(self.name())?;
            let before = img.array().as_ptr();
            let after = img.array_mut().as_mut_ptr().cast_const();
            self.in_place.store(usize::from(before == after), Ordering::SeqCst);
            Ok(Data::Image(img))
        }
    }

    #[test]
    fn test_stage_writes_in_place() {
        let in_place = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Compose::new(vec![Box::new(Touch {
            in_place: in_place.clone(),
        })]);
        pipeline.apply(image()).unwrap();
        assert_eq!(in_place.load(Ordering::SeqCst), 1);
    }

    #[test_case("1", true ; "one")]
    #[test_case(" TRUE ", true ; "padded upper case")]
    #[test_case("on", true ; "on")]
    #[test_case("0", false ; "zero")]
    #[test_case("", false ; "empty")]
    fn test_debug_env_flag(value: &str, expected: bool) {
        assert_eq!(env_flag(value), expected);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_logged(mut pipeline: Compose, data: Data) -> (Error, String) {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let err = tracing::subscriber::with_default(subscriber, || pipeline.apply(data).unwrap_err());
        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        (err, logs)
    }

    #[test]
    fn test_failure_logs_diagnostics() {
        let data = Data::record([("label", Value::from(7.0))]);
        let (err, logs) = run_logged(Compose::new(vec![Box::new(Fail)]), data);
        assert!(matches!(err, Error::Transform { .. }));
        assert!(logs.contains("Transform input info -- Fail"));
        assert!(logs.contains("field=label"));
    }

    #[test]
    fn test_debug_mode_logging() {
        let (err, logs) = run_logged(Compose::new(vec![Box::new(Fail)]).debug(true), image());
        assert!(matches!(err, Error::Value(msg) if msg == "boom"));
        assert!(!logs.contains("Transform input info"));

        let config = ComposeConfig {
            debug: true,
            log_diagnostics_in_debug: true,
            ..ComposeConfig::default()
        };
        let (err, logs) = run_logged(Compose::with_config(vec![Box::new(Fail)], config), image());
        assert!(matches!(err, Error::Value(_)));
        assert!(logs.contains("Transform input info -- Fail"));
    }

    #[test]
    fn test_list_diagnostics_describe_first_item() {
        let config = ComposeConfig {
            map_items: false,
            ..ComposeConfig::default()
        };
        let data = Data::List(vec![image(), Data::record([("label", Value::from(1.0))])]);
        let (_, logs) = run_logged(Compose::with_config(vec![Box::new(Fail)], config), data);
        assert!(logs.contains("shape [1, 2, 2]"));
        assert!(!logs.contains("list with"));
    }
}
