use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight given to a dominant parent when the other parent's trait is recessive.
pub const DOMINANT_WEIGHT: f64 = 0.75;

/// Trait names seeded on freshly spawned agents that declare none.
pub const DEFAULT_TRAITS: &[&str] = &[
    "curiosity",
    "sociability",
    "resilience",
    "creativity",
    "caution",
];

/// A single bounded characteristic (0.0-1.0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub dominant: bool,
}

impl Trait {
    /// Build a trait, clamping the value into [0, 1]. Non-finite values become 0.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: clamp_unit(value),
            dominant: false,
        }
    }

    pub fn dominant(mut self) -> Self {
        self.dominant = true;
        self
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Parameters of the inheritance rule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inheritance {
    /// Weight of the first parent when neither or both traits are dominant
    pub weight: f64,
    /// Mutation is drawn uniformly from [-bound, bound]
    pub mutation_bound: f64,
}

impl Default for Inheritance {
    fn default() -> Self {
        Self {
            weight: 0.5,
            mutation_bound: 0.1,
        }
    }
}

/// Mapping of trait name to trait, unique by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitSet {
    traits: BTreeMap<String, Trait>,
}

impl TraitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from name/value pairs, clamping every value.
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for (name, value) in values {
            set.insert(Trait::new(name, value));
        }
        set
    }

    /// Random values for the default trait names
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::from_values(DEFAULT_TRAITS.iter().map(|name| (*name, rng.gen::<f64>())))
    }

    /// Insert or replace a trait. Out-of-range values are clamped, not rejected.
    pub fn insert(&mut self, mut t: Trait) {
        t.value = clamp_unit(t.value);
        self.traits.insert(t.name.clone(), t);
    }

    pub fn get(&self, name: &str) -> Option<&Trait> {
        self.traits.get(name)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.traits.get(name).map(|t| t.value)
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trait> {
        self.traits.values()
    }

    /// Names of the `n` highest-valued traits, highest first
    pub fn dominant_traits(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<&Trait> = self.traits.values().collect();
        ranked.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        ranked.into_iter().take(n).map(|t| t.name.clone()).collect()
    }

    /// Similarity over shared traits: mean of `1 - |a - b|`, with traits that
    /// are dominant in either parent counted twice. Zero when nothing is shared.
    pub fn compatibility(&self, other: &TraitSet) -> f64 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (name, a) in &self.traits {
            if let Some(b) = other.traits.get(name) {
                let w = if a.dominant || b.dominant { 2.0 } else { 1.0 };
                total += w * (1.0 - (a.value - b.value).abs()).max(0.0);
                weight_sum += w;
            }
        }
        if weight_sum == 0.0 {
            0.0
        } else {
            total / weight_sum
        }
    }

    /// Combine two parents into a child trait set.
    ///
    /// Every trait present in either parent is inherited. Shared traits take
    /// the weighted average of both values (shifted toward a dominant parent),
    /// one-sided traits carry the single parent's value. Each value then gets a
    /// uniform mutation in `[-bound, bound]` and is clamped back into [0, 1].
    pub fn combine<R: Rng + ?Sized>(
        a: &TraitSet,
        b: &TraitSet,
        rule: Inheritance,
        rng: &mut R,
    ) -> TraitSet {
        let bound = if rule.mutation_bound.is_finite() {
            rule.mutation_bound.abs()
        } else {
            0.0
        };
        let base_weight = clamp_unit(rule.weight);

        let mut names: Vec<&String> = a.traits.keys().chain(b.traits.keys()).collect();
        names.sort();
        names.dedup();

        let mut child = TraitSet::new();
        for name in names {
            let (value, dominant) = match (a.traits.get(name), b.traits.get(name)) {
                (Some(ta), Some(tb)) => {
                    let w = match (ta.dominant, tb.dominant) {
                        (true, false) => DOMINANT_WEIGHT,
                        (false, true) => 1.0 - DOMINANT_WEIGHT,
                        _ => base_weight,
                    };
                    (w * ta.value + (1.0 - w) * tb.value, ta.dominant || tb.dominant)
                }
                (Some(t), None) | (None, Some(t)) => (t.value, t.dominant),
                (None, None) => continue,
            };
            let mutation = if bound > 0.0 {
                rng.gen_range(-bound..=bound)
            } else {
                0.0
            };
            child.insert(Trait {
                name: name.clone(),
                value: clamp_unit(value + mutation),
                dominant,
            });
        }
        child
    }
}
