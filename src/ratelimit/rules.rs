//! Rate limit rules configuration and validation.
//!
//! Rules are loaded once from YAML, validated into immutable [`Rule`]s and
//! grouped into a [`RuleSet`]. Any malformed rule rejects the whole set:
//! the process must not run with undefined limiter behavior.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::store::MAX_TTL;

/// The identifier axis a rule keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    NetworkAddress,
    Account,
    Credential,
    PublicKey,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::NetworkAddress,
        Dimension::Account,
        Dimension::Credential,
        Dimension::PublicKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::NetworkAddress => "network_address",
            Dimension::Account => "account",
            Dimension::Credential => "credential",
            Dimension::PublicKey => "public_key",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| FloodgateError::UnknownDimension(s.to_string()))
    }
}

/// The counting algorithm a rule enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per epoch-aligned window. Admits up to twice the limit
    /// across a window boundary.
    FixedWindow,
    /// Log of admitted timestamps over the trailing window.
    SlidingWindow,
    /// Bursts up to `capacity`, refilled by `refill_rate` tokens per window.
    TokenBucket { capacity: u64, refill_rate: f64 },
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket { .. } => "token_bucket",
        }
    }
}

/// Algorithm names accepted in rule files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// A rule as written in a rule file, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Stable identity; derived from the other fields when omitted
    #[serde(default)]
    pub name: Option<String>,
    /// Inferred when omitted: token bucket if both bucket fields are set
    #[serde(default)]
    pub algorithm: Option<AlgorithmKind>,
    pub dimension: Option<Dimension>,
    /// Units per window; defaults to `bucket_capacity` for token buckets
    #[serde(default)]
    pub limit: Option<u64>,
    /// `<n>ms`, `<n>s`, `<n>m`, `<n>h` or `<n>d`
    pub window: String,
    #[serde(default)]
    pub bucket_capacity: Option<u64>,
    /// Tokens added per window
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

/// The file format: a list of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSetConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A validated rate limit rule. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    id: String,
    algorithm: Algorithm,
    dimension: Dimension,
    limit: u64,
    #[serde(serialize_with = "serialize_window")]
    window: Duration,
}

fn serialize_window<S: Serializer>(window: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_window(*window))
}

fn invalid(rule: &str, reason: impl fmt::Display) -> FloodgateError {
    FloodgateError::Config(format!("rule `{}`: {}", rule, reason))
}

impl Rule {
    /// Validate a rule as written in a rule file.
    pub fn from_config(config: RuleConfig) -> Result<Self> {
        let label = config.name.clone().unwrap_or_else(|| "<unnamed>".to_string());

        let dimension = config
            .dimension
            .ok_or_else(|| invalid(&label, "dimension is required"))?;
        let window = parse_window(&config.window).map_err(|e| invalid(&label, e))?;
        if window > MAX_TTL {
            return Err(invalid(
                &label,
                format!("window must not exceed {}", format_window(MAX_TTL)),
            ));
        }

        let bucket = match (config.bucket_capacity, config.refill_rate) {
            (Some(capacity), Some(refill_rate)) => Some((capacity, refill_rate)),
            (None, None) => None,
            _ => {
                return Err(invalid(
                    &label,
                    "bucket_capacity and refill_rate must be set together",
                ))
            }
        };

        let kind = match (config.algorithm, bucket) {
            (Some(kind), _) => kind,
            (None, Some(_)) => AlgorithmKind::TokenBucket,
            (None, None) => AlgorithmKind::FixedWindow,
        };

        let (algorithm, limit) = match (kind, bucket) {
            (AlgorithmKind::TokenBucket, Some((capacity, refill_rate))) => {
                if capacity == 0 {
                    return Err(invalid(&label, "bucket_capacity must be greater than 0"));
                }
                if !(refill_rate.is_finite() && refill_rate > 0.0) {
                    return Err(invalid(&label, "refill_rate must be a positive number"));
                }
                // The bucket's state lives until it would be full again.
                let refill_ms = capacity as f64 * window.as_millis() as f64 / refill_rate;
                if refill_ms > MAX_TTL.as_millis() as f64 {
                    return Err(invalid(
                        &label,
                        format!(
                            "bucket takes longer than {} to refill from empty",
                            format_window(MAX_TTL)
                        ),
                    ));
                }
                if matches!(config.limit, Some(limit) if limit != capacity) {
                    return Err(invalid(&label, "limit must equal bucket_capacity for token_bucket"));
                }
                (Algorithm::TokenBucket { capacity, refill_rate }, capacity)
            }
            (AlgorithmKind::TokenBucket, None) => {
                return Err(invalid(
                    &label,
                    "token_bucket requires bucket_capacity and refill_rate",
                ))
            }
            (_, Some(_)) => {
                return Err(invalid(
                    &label,
                    "bucket_capacity and refill_rate are only valid for token_bucket",
                ))
            }
            (AlgorithmKind::FixedWindow, None) => (Algorithm::FixedWindow, config.limit.unwrap_or(0)),
            (AlgorithmKind::SlidingWindow, None) => {
                (Algorithm::SlidingWindow, config.limit.unwrap_or(0))
            }
        };

        if limit == 0 {
            return Err(invalid(&label, "limit must be greater than 0"));
        }

        let id = match config.name {
            Some(name) => {
                if name.is_empty() || name.contains(|c: char| c == ':' || c.is_whitespace()) {
                    return Err(invalid(&name, "name must be non-empty without ':' or whitespace"));
                }
                name
            }
            None => format!(
                "{}-{}-{}-{}",
                algorithm.name(),
                dimension,
                limit,
                window.as_millis()
            ),
        };

        Ok(Self {
            id,
            algorithm,
            dimension,
            limit,
            window,
        })
    }

    /// Fixed window rule admitting `limit` units per `window`.
    pub fn fixed_window(name: &str, dimension: Dimension, limit: u64, window: Duration) -> Result<Self> {
        Self::from_config(RuleConfig {
            name: Some(name.to_string()),
            algorithm: Some(AlgorithmKind::FixedWindow),
            dimension: Some(dimension),
            limit: Some(limit),
            window: format_window(window),
            ..Default::default()
        })
    }

    /// Sliding window rule admitting `limit` units in any trailing `window`.
    pub fn sliding_window(name: &str, dimension: Dimension, limit: u64, window: Duration) -> Result<Self> {
        Self::from_config(RuleConfig {
            name: Some(name.to_string()),
            algorithm: Some(AlgorithmKind::SlidingWindow),
            dimension: Some(dimension),
            limit: Some(limit),
            window: format_window(window),
            ..Default::default()
        })
    }

    /// Token bucket rule holding `capacity` tokens, refilled by `refill_rate` per `window`.
    pub fn token_bucket(
        name: &str,
        dimension: Dimension,
        capacity: u64,
        refill_rate: f64,
        window: Duration,
    ) -> Result<Self> {
        Self::from_config(RuleConfig {
            name: Some(name.to_string()),
            algorithm: Some(AlgorithmKind::TokenBucket),
            dimension: Some(dimension),
            window: format_window(window),
            bucket_capacity: Some(capacity),
            refill_rate: Some(refill_rate),
            ..Default::default()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    /// Maximum units per window (the capacity, for token buckets).
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// An ordered, immutable collection of rules with unique identities.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rule set, rejecting duplicate rule identities.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id()) {
                return Err(invalid(rule.id(), "duplicate rule name"));
            }
        }
        Ok(Self { rules })
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RuleSetConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        let rules = config
            .rules
            .into_iter()
            .map(Rule::from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::from_rules(rules)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id() == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m`, `<n>h` or `<n>d` into a non-zero duration.
pub fn parse_window(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("window `{}` is missing a unit", text))?;
    let (digits, unit) = text.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("window `{}` must start with a whole number", text))?;

    let millis_per_unit = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => return Err(format!("window `{}` has unknown unit `{}`", text, other)),
    };

    let millis = amount
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("window `{}` is too large", text))?;
    if millis == 0 {
        return Err("window must be greater than 0".to_string());
    }
    Ok(Duration::from_millis(millis))
}

/// Render a duration in the largest unit that divides it exactly.
pub fn format_window(window: Duration) -> String {
    let millis = window.as_millis() as u64;
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if millis > 0 && millis % size == 0 {
            return format!("{}{}", millis / size, unit);
        }
    }
    format!("{}ms", millis)
}
