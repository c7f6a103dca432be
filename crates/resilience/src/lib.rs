//! Circuit-breaking publisher for every downstream call Codex makes.
//!
//! Retry, backoff, and circuit policy are defined here once and applied
//! uniformly; callers never write their own retry loops.
//!
//! ## Architectural Layer
//!
//! **Cross-cutting infrastructure.** Depends on `pipeline` for the
//! [`pipeline::DependencyError`] taxonomy only.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`breaker`] | `CircuitBreaker` state machine, `BreakerRegistry`, transition observer |
//! | [`retry`] | `RetryConfig`: bounded exponential backoff with jitter |
//! | [`fallback`] | `FallbackCache` trait, `LastKnownGood`, `NeutralDefault` |
//! | [`publisher`] | `CircuitBreakingPublisher` and `Guarded` results |

pub mod breaker;
pub mod fallback;
pub mod publisher;
pub mod retry;

pub use breaker::{
    Admission, BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker, TransitionObserver,
};
pub use fallback::{FallbackCache, LastKnownGood, NeutralDefault, DEFAULT_FALLBACK_CAPACITY};
pub use publisher::{CircuitBreakingPublisher, Guarded};
pub use retry::RetryConfig;
