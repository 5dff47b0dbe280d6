//! Resource vectors and quantity parsing.
//!
//! A [`ResourceVector`] maps resource names (`cpu`, `memory`, `nvidia.com/gpu`,
//! ...) to non-negative quantities. Missing components read as zero. Vectors
//! deserialise from JSON numbers or Kubernetes-style quantity strings, so both
//! `{"cpu": 2}` and `{"cpu": "2000m", "memory": "4Gi"}` are accepted.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// Drift below zero tolerated after repeated subtraction. Must stay well
/// under one milli-unit, the smallest parseable quantity.
const QUANTITY_TOLERANCE: f64 = 1e-9;

/// Resource name to quantity mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResourceVector(BTreeMap<String, f64>);

impl ResourceVector {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the quantity of `name`, or zero when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    /// Sets the quantity of `name`.
    pub fn set(&mut self, name: impl Into<String>, quantity: f64) {
        self.0.insert(name.into(), quantity);
    }

    /// Iterates over components in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, quantity)| (name.as_str(), *quantity))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Adds `other` component-wise.
    pub fn add(&mut self, other: &ResourceVector) {
        for (name, quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0.0) += quantity;
        }
    }

    /// Subtracts `other` component-wise. Components missing here start at zero,
    /// so the result may become invalid.
    pub fn sub(&mut self, other: &ResourceVector) {
        for (name, quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0.0) -= quantity;
        }
    }

    /// Returns a copy with every component multiplied by `factor`.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> ResourceVector {
        Self(
            self.0
                .iter()
                .map(|(name, quantity)| (name.clone(), quantity * factor))
                .collect(),
        )
    }

    /// True when no component is negative, within a small tolerance.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.0
            .values()
            .all(|quantity| *quantity >= -QUANTITY_TOLERANCE)
    }

    /// True when every component is at most the matching component of `limit`.
    #[must_use]
    pub fn fits_within(&self, limit: &ResourceVector) -> bool {
        self.0
            .iter()
            .all(|(name, quantity)| *quantity <= limit.get(name))
    }

    /// True when every component is at least the matching component of `floor`.
    #[must_use]
    pub fn at_least(&self, floor: &ResourceVector) -> bool {
        floor.fits_within(self)
    }

    /// Component-wise sum of all vectors.
    pub fn sum<'a>(vectors: impl IntoIterator<Item = &'a ResourceVector>) -> ResourceVector {
        let mut total = ResourceVector::new();
        for vector in vectors {
            total.add(vector);
        }
        total
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ResourceVector {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<K: Into<String>, const N: usize> From<[(K, f64); N]> for ResourceVector {
    fn from(components: [(K, f64); N]) -> Self {
        components.into_iter().collect()
    }
}

impl<'de> Deserialize<'de> for ResourceVector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Quantity {
            Number(f64),
            Text(String),
        }

        let raw = BTreeMap::<String, Quantity>::deserialize(deserializer)?;
        let mut components = BTreeMap::new();
        for (name, quantity) in raw {
            let value = match quantity {
                Quantity::Number(value) => value,
                Quantity::Text(text) => parse_quantity(&text).map_err(serde::de::Error::custom)?,
            };
            components.insert(name, value);
        }
        Ok(Self(components))
    }
}

/// Parses a Kubernetes-style quantity such as `500m`, `4Gi`, `2k` or `1e3`.
pub fn parse_quantity(input: &str) -> Result<f64, ProtocolError> {
    let invalid = || ProtocolError::InvalidQuantity(input.to_owned());

    let text = input.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    let base: f64 = number.parse().map_err(|_| invalid())?;

    let multiplier = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        exponent if exponent.starts_with('e') || exponent.starts_with('E') => {
            let power: i32 = exponent[1..].parse().map_err(|_| invalid())?;
            10.0_f64.powi(power)
        }
        _ => return Err(invalid()),
    };

    let value = base * multiplier;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(value)
}
