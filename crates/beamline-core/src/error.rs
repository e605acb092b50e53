//! Error types for the beamline hardware-abstraction core.
//!
//! One central enum, [`HalError`], covers the whole crate. The variants fall
//! into a handful of kinds:
//!
//! - **Connection/timeout**: `ConnectionTimeout`, `SetTimeout`,
//!   `StatusTimeout`: a hardware wait exceeded its allotted time. All carry
//!   the signal identity (and attempted value where applicable) so a log line
//!   is actionable on its own.
//! - **Value/limit**: `LimitViolation`, `InvalidValue`: raised by
//!   `check_value` *before* any hardware write is attempted.
//! - **Read-only**: `ReadOnly`: a write against a read-only signal.
//! - **Staging**: `RedundantStaging`: `stage()` on a device that is not in
//!   the `No` state.
//! - **Aggregate**: `StopErrors`: fan-out operations (`stop()`) collect every
//!   child failure instead of surfacing only the first.
//!
//! Subscription callbacks never propagate errors to the code that fired the
//! event; those are logged and swallowed at the event bus.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, HalError>;

/// Primary error type for the beamline abstraction layer.
#[derive(Error, Debug)]
pub enum HalError {
    /// A control link did not report connected within the allotted time.
    #[error("signal '{signal}' failed to connect within {timeout:?}")]
    ConnectionTimeout { signal: String, timeout: Duration },

    /// A set-and-confirm write did not read back the target value in time.
    #[error("timed out setting '{signal}' to {value} after {timeout:?}")]
    SetTimeout {
        signal: String,
        value: serde_json::Value,
        timeout: Duration,
    },

    /// A blocking wait on a status handle ran out of time.
    #[error("status did not complete within {0:?}")]
    StatusTimeout(Duration),

    /// A status handle completed, but with `success = false`.
    #[error("operation on '{obj}' finished with failure")]
    FailedStatus { obj: String },

    /// A commanded value violates soft limits. Raised before any hardware
    /// interaction.
    #[error("value {value} violates limits [{low}, {high}] on '{name}'")]
    LimitViolation {
        name: String,
        value: f64,
        low: f64,
        high: f64,
    },

    /// A value failed validation for a reason other than numeric limits.
    #[error("invalid value for '{name}': {message}")]
    InvalidValue { name: String, message: String },

    /// Write attempted against a read-only signal.
    #[error("signal '{0}' is read-only")]
    ReadOnly(String),

    /// `stage()` called on a device that is not in the `No` state.
    ///
    /// The carried state distinguishes a device left half-staged by a failed
    /// unstage (`partially`) from one that is simply already staged (`yes`).
    #[error("device '{device}' is {state} staged; unstage it first")]
    RedundantStaging {
        device: String,
        state: crate::device::Staged,
    },

    /// An event type was fired or subscribed to that the object never
    /// declared.
    #[error("unknown event type '{event_type}' on '{obj}'")]
    UnknownEventType { obj: String, event_type: String },

    /// An object with no default event type was subscribed to without an
    /// explicit one.
    #[error("'{0}' has no default event type; pass one explicitly")]
    NoDefaultEventType(String),

    /// Lookup of a component attribute that the device schema never declared.
    #[error("device '{device}' has no component '{attr}'")]
    UnknownComponent { device: String, attr: String },

    /// A schema declared a component under a reserved attribute name.
    #[error("'{0}' is a reserved attribute name and cannot be a component")]
    ReservedName(String),

    /// A pseudo-position vector had the wrong number of axes.
    #[error("expected {expected} axis values, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Forward/inverse kinematics failed to produce a position vector.
    #[error("kinematics error: {0}")]
    Kinematics(String),

    /// Error reported by a control-link backend.
    #[error("control link error on '{signal}': {message}")]
    Link { signal: String, message: String },

    /// `configure()` was handed a key that is not a configuration attribute.
    #[error("'{attr}' is not a configuration attribute of '{device}'")]
    NotConfigurable { device: String, attr: String },

    /// Recursive `stop()` collected failures from multiple children.
    #[error("stopping '{device}' failed for {} child(ren)", errors.len())]
    StopErrors {
        device: String,
        errors: Vec<HalError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_staging_message_distinguishes_partial() {
        let full = HalError::RedundantStaging {
            device: "det".into(),
            state: crate::device::Staged::Yes,
        };
        let partial = HalError::RedundantStaging {
            device: "det".into(),
            state: crate::device::Staged::Partially,
        };
        assert!(full.to_string().contains("already staged"));
        assert!(partial.to_string().contains("partially staged"));
    }

    #[test]
    fn stop_errors_reports_count() {
        let err = HalError::StopErrors {
            device: "slits".into(),
            errors: vec![
                HalError::ReadOnly("slits_gap".into()),
                HalError::StatusTimeout(Duration::from_secs(1)),
            ],
        };
        assert!(err.to_string().contains("2 child(ren)"));
    }
}
