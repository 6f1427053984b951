//! Error types for the raytracing context.
//!
//! The context distinguishes two kinds of failure:
//!
//! - **Fatal configuration failures**: a fixed-size table ran out of slots, or the
//!   device offers neither hardware nor emulated raytracing. These are sizing or
//!   platform problems and are never retried. Callers are expected to terminate
//!   with the diagnostic carried by the error.
//! - **Runtime failures**: the backend refused to create a resource, a state object
//!   was used with the wrong context, and similar.
//!
//! Protocol violations (a barrier from the wrong state, a dispatch without a bound
//! descriptor heap) are *not* reported here. The context keeps no hidden state to
//! detect them; the validation layer of
//! [`RecordingDevice`](crate::backend::recording::RecordingDevice) catches them.

use std::fmt;

use thiserror::Error;

use crate::capability::CapabilityMode;

/// Fixed-capacity tables owned by a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// The shader-visible descriptor heap.
    DescriptorHeap,
    /// The wrapped-pointer indirection table of the emulated path.
    IndirectionTable,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::DescriptorHeap => write!(f, "descriptor heap"),
            TableKind::IndirectionTable => write!(f, "indirection table"),
        }
    }
}

/// Broad classification of an [`RtError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// A fixed-size table was exhausted.
    ConfigurationExhaustion,
    /// Neither hardware nor emulated raytracing could be obtained.
    CapabilityUnavailable,
    /// Anything else.
    Runtime,
}

/// Main error type for context operations.
#[derive(Error, Debug)]
pub enum RtError {
    /// A fixed-capacity table has no free slot left.
    #[error("{table} exhausted: all {capacity} slots are allocated")]
    Exhausted { table: TableKind, capacity: u32 },

    /// The device supports neither native raytracing nor the compute fallback.
    #[error("no raytracing capability on device '{device}': {reason}")]
    CapabilityUnavailable { device: String, reason: String },

    /// An object created under one capability mode was used under the other.
    #[error("object was created for {expected:?} mode but the context runs in {actual:?} mode")]
    ModeMismatch {
        expected: CapabilityMode,
        actual: CapabilityMode,
    },

    /// A wrapped pointer that this context never issued.
    #[error("wrapped pointer {0:#x} does not belong to this context")]
    UnknownPointer(u64),

    /// An instance field does not fit the custom data the hardware path packs it into.
    #[error("instance {instance}: {field} {value} exceeds the native limit of {limit}")]
    InstanceFieldOverflow {
        instance: usize,
        field: &'static str,
        value: u32,
        limit: u32,
    },

    /// A shader export name missing from a state object.
    #[error("shader export not found in state object: {0}")]
    MissingExport(String),

    /// An object was used before the step that prepares it.
    #[error("{0} has not been prepared")]
    NotPrepared(&'static str),

    /// The backend failed to perform an operation.
    #[error("device error: {0}")]
    Device(String),
}

impl RtError {
    /// Shorthand for [`RtError::Device`].
    pub fn device(msg: impl Into<String>) -> Self {
        RtError::Device(msg.into())
    }

    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RtError::Exhausted { .. } => ErrorCategory::ConfigurationExhaustion,
            RtError::CapabilityUnavailable { .. } => ErrorCategory::CapabilityUnavailable,
            _ => ErrorCategory::Runtime,
        }
    }

    /// Whether the error indicates a static misconfiguration the process cannot
    /// recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Runtime)
    }
}

/// Result type alias for context operations.
pub type Result<T> = std::result::Result<T, RtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_fatal() {
        let err = RtError::Exhausted {
            table: TableKind::DescriptorHeap,
            capacity: 1024,
        };
        assert_eq!(err.category(), ErrorCategory::ConfigurationExhaustion);
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "descriptor heap exhausted: all 1024 slots are allocated"
        );
    }

    #[test]
    fn device_errors_are_not_fatal() {
        let err = RtError::device("out of memory");
        assert_eq!(err.category(), ErrorCategory::Runtime);
        assert!(!err.is_fatal());
    }
}
