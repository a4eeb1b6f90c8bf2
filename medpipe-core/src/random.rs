//! Instance-local random state and the probabilistic gate of random transforms
//!
//! Every randomizable transform owns its own [`RandomState`]; nothing in this
//! crate draws from a process-global generator, so two instances seeded alike
//! reproduce the same draws regardless of what other pipelines are doing.
//! Randomizable transforms are not thread-safe: a worker must own its copy.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::data::Data;
use crate::error::{Error, Result};

/// Seeds are folded into `[0, MAX_SEED)`
pub const MAX_SEED: u64 = 1 << 32;

/// A seed for a [`RandomState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Seed {
    /// An integer seed, used modulo [`MAX_SEED`]
    Int(u64),
    /// The stable hash of a non-integer seed, used modulo [`MAX_SEED`]
    Hashed(u64),
}

impl Seed {
    /// Seed from the hash of any hashable value
    pub fn hashed<H: Hash + ?Sized>(value: &H) -> Self {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        Seed::Hashed(hasher.finish())
    }

    /// The seed actually handed to the generator
    pub fn effective(self) -> u64 {
        match self {
            Seed::Int(v) | Seed::Hashed(v) => v % MAX_SEED,
        }
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Seed::Int(value)
    }
}

impl From<u32> for Seed {
    fn from(value: u32) -> Self {
        Seed::Int(u64::from(value))
    }
}

impl From<i64> for Seed {
    fn from(value: i64) -> Self {
        // MAX_SEED fits in i64, and rem_euclid keeps negative seeds in range
        Seed::Int(value.rem_euclid(MAX_SEED as i64) as u64)
    }
}

impl From<i32> for Seed {
    fn from(value: i32) -> Self {
        Seed::from(i64::from(value))
    }
}

impl From<&str> for Seed {
    fn from(value: &str) -> Self {
        Seed::hashed(value)
    }
}

impl From<String> for Seed {
    fn from(value: String) -> Self {
        Seed::hashed(&value)
    }
}

/// A pseudo-random source owned by exactly one transform
#[derive(Debug, Clone)]
pub struct RandomState {
    rng: StdRng,
    seed: Option<u64>,
}

impl RandomState {
    /// A state seeded from operating-system entropy
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            seed: None,
        }
    }

    /// A reproducible state
    pub fn from_seed(seed: impl Into<Seed>) -> Self {
        let seed = seed.into().effective();
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed: Some(seed),
        }
    }

    /// The state described by a seed or an existing state; entropy-seeded
    /// when neither is given. Supplying both is a type error.
    pub fn resolve(seed: Option<Seed>, state: Option<RandomState>) -> Result<Self> {
        match (seed, state) {
            (Some(_), Some(_)) => Err(Error::Type(
                "set_random_state accepts a seed or a state, not both".into(),
            )),
            (Some(seed), None) => Ok(Self::from_seed(seed)),
            (None, Some(state)) => Ok(state),
            (None, None) => Ok(Self::new()),
        }
    }

    /// The effective seed, if this state was seeded explicitly
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// A draw from `[0, 1)`
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// A draw from `[low, high)`; `low` when the range is empty
    pub fn uniform_range(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    /// An integer draw from `[0, n)`; 0 when `n == 0`
    pub fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.rng.gen_range(0..n)
    }

    /// A fresh seed for a child state
    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen_range(0..MAX_SEED)
    }

    /// Shuffle `items` in place
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Index drawn according to `weights`, which must sum to one
    pub fn choose_weighted(&mut self, weights: &[f64]) -> usize {
        let target = self.uniform();
        let mut cumulative = 0.0;
        let mut last_positive = 0;
        for (index, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            last_positive = index;
            cumulative += w;
            if target < cumulative {
                return index;
            }
        }
        // rounding can leave the cumulative sum just below one
        last_positive
    }
}

impl Default for RandomState {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that draws all its randomness from an instance-local state
pub trait Randomizable {
    /// The state this instance draws from
    fn random_state_mut(&mut self) -> &mut RandomState;

    /// Replace the random state.
    ///
    /// Accepts either a seed or a whole state; with neither, the state is
    /// re-seeded from entropy. Supplying both is a type error.
    fn set_random_state(&mut self, seed: Option<Seed>, state: Option<RandomState>) -> Result<()> {
        *self.random_state_mut() = RandomState::resolve(seed, state)?;
        Ok(())
    }

    /// Draw the random factors for the next call.
    ///
    /// Implementations may inspect `data` (e.g. its spatial shape) but must
    /// only draw from [`Randomizable::random_state_mut`].
    fn randomize(&mut self, _data: &Data) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "{} must implement randomize",
            std::any::type_name::<Self>()
        )))
    }

    /// Builder form of [`Randomizable::set_random_state`] with a seed
    fn seeded(mut self, seed: impl Into<Seed>) -> Self
    where
        Self: Sized,
    {
        // a seed alone never conflicts, so this cannot fail
        let _ = self.set_random_state(Some(seed.into()), None);
        self
    }

    /// Builder form of [`Randomizable::set_random_state`]
    fn with_random_state(mut self, seed: Option<Seed>, state: Option<RandomState>) -> Result<Self>
    where
        Self: Sized,
    {
        self.set_random_state(seed, state)?;
        Ok(self)
    }
}

/// Validate a probability for a random transform
pub fn validate_probability(prob: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&prob) {
        return Err(Error::Value(format!(
            "probability must be in [0, 1], got {}",
            prob
        )));
    }
    Ok(prob)
}

/// The `do_transform` gate shared by random transforms.
///
/// `randomize` decides whether the next application takes effect; callers may
/// inspect or override the decision before applying.
#[derive(Debug, Clone)]
pub struct RandGate {
    prob: f64,
    do_transform: bool,
    state: RandomState,
}

impl RandGate {
    /// A gate that fires with probability `prob`
    pub fn new(prob: f64) -> Result<Self> {
        Ok(Self {
            prob: validate_probability(prob)?,
            do_transform: true,
            state: RandomState::new(),
        })
    }

    /// Probability of firing
    pub fn prob(&self) -> f64 {
        self.prob
    }

    /// The current decision
    pub fn do_transform(&self) -> bool {
        self.do_transform
    }

    /// Override the current decision
    pub fn set_do_transform(&mut self, do_transform: bool) {
        self.do_transform = do_transform;
    }

    /// Draw a new decision
    pub fn randomize(&mut self) -> bool {
        self.do_transform = self.state.uniform() < self.prob;
        self.do_transform
    }

    /// The gate's random state, also used for a transform's other draws
    pub fn state_mut(&mut self) -> &mut RandomState {
        &mut self.state
    }
}
