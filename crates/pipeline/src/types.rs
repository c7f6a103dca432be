//! Shared value types for the ingestion domain.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! meaningful values with invariants (e.g. scores are in `[0.0, 100.0]`,
//! complexity is non-negative) and participate in domain computations.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Score types
// ---------------------------------------------------------------------------

macro_rules! percent_score {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
        #[serde(try_from = "f64", into = "f64")]
        pub struct $name(f64);

        impl $name {
            /// Lowest valid score.
            pub const MIN: Self = Self(0.0);
            /// Highest valid score.
            pub const MAX: Self = Self(100.0);

            /// Creates a score, returning `None` if `value` is outside `[0.0, 100.0]`.
            #[must_use]
            pub fn new(value: f64) -> Option<Self> {
                if value.is_finite() && (0.0..=100.0).contains(&value) {
                    Some(Self(value))
                } else {
                    None
                }
            }

            /// Creates a score, clamping `value` into `[0.0, 100.0]`.
            ///
            /// NaN maps to [`Self::MIN`].
            pub fn clamped(value: f64) -> Self {
                if value.is_nan() {
                    Self::MIN
                } else {
                    Self(value.clamp(0.0, 100.0))
                }
            }

            /// Returns the score as an `f64` in `[0.0, 100.0]`.
            pub fn as_f64(self) -> f64 {
                self.0
            }
        }

        impl TryFrom<f64> for $name {
            type Error = String;

            fn try_from(value: f64) -> Result<Self, Self::Error> {
                Self::new(value).ok_or_else(|| format!("{value} is outside [0, 100]"))
            }
        }

        impl From<$name> for f64 {
            fn from(score: $name) -> f64 {
                score.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:.1}", self.0)
            }
        }
    };
}

percent_score! {
    /// Risk of a pull request in the range `[0.0, 100.0]` (higher = riskier).
    ///
    /// Produced by the risk scorer during impact analysis; stored on the
    /// pull request entity.
    RiskScore
}

percent_score! {
    /// Derived repository health in the range `[0.0, 100.0]` (higher = healthier).
    ///
    /// Never authoritative input: always recomputed from the graph.
    HealthScore
}

// ---------------------------------------------------------------------------

/// Cyclomatic-style complexity of a symbol. Always finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ComplexityScore(f64);

impl ComplexityScore {
    /// Creates a [`ComplexityScore`], returning `None` if `value` is negative,
    /// infinite, or NaN.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value >= 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Returns the underlying value.
    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for ComplexityScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

/// A dense vector embedding used for nearest-neighbour lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Creates an embedding, returning `None` if it is empty or contains
    /// non-finite components.
    pub fn new(values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            None
        } else {
            Some(Self(values))
        }
    }

    /// Number of dimensions.
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Returns the raw components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Cosine similarity in `[-1.0, 1.0]`.
    ///
    /// Returns `None` when dimensions differ or either vector has zero norm.
    pub fn cosine_similarity(&self, other: &Embedding) -> Option<f32> {
        if self.0.len() != other.0.len() {
            return None;
        }
        let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
        for (a, b) in self.0.iter().zip(&other.0) {
            dot += a * b;
            na += a * a;
            nb += b * b;
        }
        if na == 0.0 || nb == 0.0 {
            return None;
        }
        Some(dot / (na.sqrt() * nb.sqrt()))
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// A UTC wall-clock timestamp.
///
/// Wraps [`chrono::DateTime<Utc>`] so callers never depend on `chrono` types
/// directly; the underlying representation can change without affecting the
/// domain API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the current UTC time as a [`Timestamp`].
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a [`Timestamp`] from a [`DateTime<Utc>`].
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parses an RFC 3339 timestamp (the format GitHub uses in payloads).
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Creates a [`Timestamp`] from whole seconds since the Unix epoch.
    pub fn from_unix_seconds(secs: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp(secs, 0).map(Self)
    }

    /// Returns whole seconds since the Unix epoch.
    pub fn unix_seconds(self) -> i64 {
        self.0.timestamp()
    }

    /// Creates a [`Timestamp`] from milliseconds since the Unix epoch.
    pub fn from_unix_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self)
    }

    /// Returns milliseconds since the Unix epoch.
    pub fn unix_millis(self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the underlying [`DateTime<Utc>`].
    pub fn as_datetime(self) -> DateTime<Utc> {
        self.0
    }

    /// Returns this timestamp moved back by `by`, saturating at the minimum
    /// representable time.
    pub fn saturating_sub(self, by: Duration) -> Self {
        chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| self.0.checked_sub_signed(d))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MIN_UTC))
    }

    /// Time elapsed from `earlier` to `self`; zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_enforce_percent_range() {
        assert!(RiskScore::new(-0.1).is_none());
        assert!(RiskScore::new(100.1).is_none());
        assert!(RiskScore::new(f64::NAN).is_none());
        assert_eq!(RiskScore::new(42.0).unwrap().as_f64(), 42.0);
        assert_eq!(HealthScore::clamped(180.0), HealthScore::MAX);
        assert_eq!(HealthScore::clamped(f64::NAN), HealthScore::MIN);
    }

    #[test]
    fn scores_reject_out_of_range_on_deserialise() {
        assert!(serde_json::from_str::<RiskScore>("101.0").is_err());
        let score: RiskScore = serde_json::from_str("12.5").unwrap();
        assert_eq!(score.as_f64(), 12.5);
    }

    #[test]
    fn cosine_similarity_handles_degenerate_vectors() {
        let a = Embedding::new(vec![1.0, 0.0]).unwrap();
        let b = Embedding::new(vec![0.0, 1.0]).unwrap();
        let c = Embedding::new(vec![2.0, 0.0]).unwrap();
        let zero = Embedding::new(vec![0.0, 0.0]).unwrap();
        let other_dim = Embedding::new(vec![1.0, 0.0, 0.0]).unwrap();

        assert_eq!(a.cosine_similarity(&b), Some(0.0));
        assert!((a.cosine_similarity(&c).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(a.cosine_similarity(&zero), None);
        assert_eq!(a.cosine_similarity(&other_dim), None);
        assert!(Embedding::new(vec![]).is_none());
        assert!(Embedding::new(vec![f32::INFINITY]).is_none());
    }

    #[test]
    fn timestamp_arithmetic_saturates() {
        let t = Timestamp::from_unix_seconds(1_000).unwrap();
        let earlier = t.saturating_sub(Duration::from_secs(400));
        assert_eq!(earlier.unix_seconds(), 600);
        assert_eq!(t.duration_since(earlier), Duration::from_secs(400));
        assert_eq!(earlier.duration_since(t), Duration::ZERO);
    }
}
