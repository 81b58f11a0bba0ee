//! Rate limiting rules, algorithms and orchestration.

mod clock;
mod decision;
mod fixed_window;
mod identifier;
mod limiter;
mod rules;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use decision::{CombinedDecision, Decision};
pub use identifier::{CounterKey, IdentifierBundle};
pub use limiter::{
    FailurePolicy, Limiter, LimiterOptions, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
};
pub use rules::{
    format_window, parse_window, Algorithm, AlgorithmKind, Dimension, Rule, RuleConfig, RuleSet,
    RuleSetConfig,
};
pub use strategy::check;
