//! AWS error classification.
//!
//! Provides typed categories for the SDK errors the engine reacts to,
//! matched by error code rather than by message text where possible.

use thiserror::Error;

/// AWS error categories for retry and recovery decisions.
#[derive(Debug, Error)]
pub enum AwsError {
    /// Resource no longer exists; safe to treat as already gone.
    #[error("resource not found")]
    NotFound,

    /// Resource already exists; creation can reuse it.
    #[error("resource already exists")]
    AlreadyExists,

    /// Rate limit exceeded; retryable with backoff.
    #[error("rate limit exceeded")]
    Throttled,

    /// The spot market has no capacity for the requested type.
    #[error("insufficient instance capacity")]
    InsufficientCapacity,

    /// Anything else.
    #[error("AWS error: {message}")]
    Sdk {
        code: Option<String>,
        message: String,
    },
}

impl AwsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, AwsError::AlreadyExists)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AwsError::Throttled)
    }
}

const NOT_FOUND_CODES: &[&str] = &[
    "InvalidInstanceID.NotFound",
    "InvalidLaunchTemplateName.NotFoundException",
    "InvalidLaunchTemplateId.NotFound",
];

const ALREADY_EXISTS_CODES: &[&str] = &["InvalidLaunchTemplateName.AlreadyExistsException"];

const THROTTLING_CODES: &[&str] = &["Throttling", "ThrottlingException", "RequestLimitExceeded"];

const CAPACITY_CODES: &[&str] = &["InsufficientInstanceCapacity", "SpotMaxPriceTooLow"];

/// Classify an AWS SDK error from its code and message.
pub fn classify_aws_error(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("Unknown error").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound,
        Some(c) if ALREADY_EXISTS_CODES.contains(&c) => AwsError::AlreadyExists,
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled,
        Some(c) if CAPACITY_CODES.contains(&c) => AwsError::InsufficientCapacity,
        // Some callers only surface the exception name in the message.
        Some(_) | None if message.contains("AlreadyExistsException") => AwsError::AlreadyExists,
        _ => AwsError::Sdk {
            code: code.map(str::to_string),
            message,
        },
    }
}

/// Fallback classification for errors that already went through `anyhow`,
/// matching on the debug output as a last resort.
pub fn classify_anyhow_error(error: &anyhow::Error) -> AwsError {
    let debug = format!("{error:?}");

    for code in NOT_FOUND_CODES {
        if debug.contains(code) {
            return AwsError::NotFound;
        }
    }
    for code in ALREADY_EXISTS_CODES {
        if debug.contains(code) {
            return AwsError::AlreadyExists;
        }
    }
    if debug.contains("AlreadyExistsException") {
        return AwsError::AlreadyExists;
    }
    for code in THROTTLING_CODES {
        if debug.contains(code) {
            return AwsError::Throttled;
        }
    }
    for code in CAPACITY_CODES {
        if debug.contains(code) {
            return AwsError::InsufficientCapacity;
        }
    }

    AwsError::Sdk {
        code: None,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_classify_into_categories() {
        assert!(classify_aws_error(Some("InvalidInstanceID.NotFound"), None).is_not_found());
        assert!(classify_aws_error(
            Some("InvalidLaunchTemplateName.AlreadyExistsException"),
            None
        )
        .is_already_exists());
        assert!(classify_aws_error(Some("RequestLimitExceeded"), None).is_retryable());
        assert!(matches!(
            classify_aws_error(Some("InsufficientInstanceCapacity"), None),
            AwsError::InsufficientCapacity
        ));
    }

    #[test]
    fn unknown_codes_fall_back_to_sdk() {
        let error = classify_aws_error(Some("SomethingElse"), Some("boom"));
        assert!(matches!(error, AwsError::Sdk { .. }));
    }

    #[test]
    fn anyhow_fallback_matches_on_debug_output() {
        let error = anyhow::anyhow!("service error: InvalidLaunchTemplateName.AlreadyExistsException: in use");
        assert!(classify_anyhow_error(&error).is_already_exists());

        let throttled = anyhow::anyhow!("ThrottlingException: slow down");
        assert!(classify_anyhow_error(&throttled).is_retryable());
    }

    #[test]
    fn message_only_already_exists_is_recognized() {
        let error = classify_aws_error(None, Some("AlreadyExistsException: lt name in use"));
        assert!(error.is_already_exists());
    }
}
