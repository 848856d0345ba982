//! Typed error kinds for the replacement engine.

use thiserror::Error;

/// Errors surfaced by the replacement engine.
///
/// `NotEligible`, `NoCandidate` and `CapacityExhausted` end the current
/// event after a log line; `Cloud` errors are surfaced to the invoker so
/// the hosting platform can retry through its native channel.
#[derive(Debug, Error)]
pub enum ReplacementError {
    /// The event target is not something the engine should act on.
    #[error("not eligible: {0}")]
    NotEligible(String),

    /// The compatibility filter produced an empty candidate list.
    #[error("no compatible spot instance type could be found")]
    NoCandidate,

    /// The fleet request failed for every candidate override.
    #[error("spot capacity exhausted for every candidate type")]
    CapacityExhausted,

    /// Malformed flags or tags. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A cloud API call failed; the platform retry channel applies.
    #[error(transparent)]
    Cloud(#[from] anyhow::Error),
}

impl ReplacementError {
    /// True for outcomes that end the event without being reported as a
    /// failure to the invoker.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReplacementError::NotEligible(_)
                | ReplacementError::NoCandidate
                | ReplacementError::CapacityExhausted
        )
    }
}

pub type Result<T> = std::result::Result<T, ReplacementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds_end_the_event_quietly() {
        assert!(ReplacementError::NotEligible("spot already".into()).is_recoverable());
        assert!(ReplacementError::NoCandidate.is_recoverable());
        assert!(ReplacementError::CapacityExhausted.is_recoverable());
        assert!(!ReplacementError::Cloud(anyhow::anyhow!("throttled")).is_recoverable());
        assert!(!ReplacementError::Config("bad flag".into()).is_recoverable());
    }
}
