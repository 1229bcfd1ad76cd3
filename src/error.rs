//! Error types for the machinist operator
//!
//! Errors are structured with fields to aid debugging in production, and
//! every error classifies itself into a [`RetryPeriod`] so reconcilers can
//! translate failures into workqueue backoff without inspecting messages.

use std::time::Duration;

use kube::runtime::controller::Action;
use thiserror::Error;

use crate::driver::DriverErrorCode;

/// Requeue bucket for a failed or deferred reconcile.
///
/// The buckets mirror how aggressively the controller should come back:
/// transient infrastructure hiccups retry quickly, provider capacity
/// problems back off hard so the provider is not hammered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPeriod {
    /// Transient problem, retry within seconds.
    Short,
    /// Provider-side transient failure, retry within minutes.
    Medium,
    /// Capacity exhaustion or user error, retry slowly.
    Long,
}

impl RetryPeriod {
    /// The requeue delay for this bucket.
    pub fn duration(self) -> Duration {
        match self {
            RetryPeriod::Short => Duration::from_secs(5),
            RetryPeriod::Medium => Duration::from_secs(3 * 60),
            RetryPeriod::Long => Duration::from_secs(10 * 60),
        }
    }

    /// The controller action requeuing after this bucket's delay.
    pub fn action(self) -> Action {
        Action::requeue(self.duration())
    }
}

/// Main error type for machinist operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud-provider driver error, carrying the typed code the core
    /// dispatches on. Messages are surfaced to events, never interpreted.
    #[error("driver error [{code:?}] for {machine}: {message}")]
    Driver {
        /// Name of the machine the driver call was for
        machine: String,
        /// Typed provider error code
        code: DriverErrorCode,
        /// Provider-supplied description
        message: String,
    },

    /// Validation error for CRD specs or cross-resource references
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// The offending resource (kind/name)
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Node drain failure
    #[error("drain error for node {node}: {message}")]
    Drain {
        /// Node being drained
        node: String,
        /// Description of what failed
        message: String,
    },

    /// All mutation is frozen because an API server is unreachable
    #[error("operations frozen: {reason}")]
    Frozen {
        /// Why the freeze is in effect
        reason: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Context where the error occurred (e.g. "machineset", "rollout")
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error for the given resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a drain error for the given node
    pub fn drain(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a driver error for the given machine
    pub fn driver(machine: impl Into<String>, code: DriverErrorCode, msg: impl Into<String>) -> Self {
        Self::Driver {
            machine: machine.into(),
            code,
            message: msg.into(),
        }
    }

    /// Classify this error into a requeue bucket.
    ///
    /// - API conflicts and rate limits are transient: Short.
    /// - Provider `Internal`/`DeadlineExceeded` back off Medium.
    /// - Provider `ResourceExhausted` and user errors back off Long;
    ///   hammering an out-of-capacity provider or an invalid spec helps
    ///   nobody.
    pub fn retry_period(&self) -> RetryPeriod {
        match self {
            Error::Kube { .. } => RetryPeriod::Short,
            Error::Driver { code, .. } => match code {
                DriverErrorCode::ResourceExhausted => RetryPeriod::Long,
                DriverErrorCode::Internal | DriverErrorCode::DeadlineExceeded => {
                    RetryPeriod::Medium
                }
                DriverErrorCode::Uninitialized => RetryPeriod::Short,
                DriverErrorCode::NotFound | DriverErrorCode::Unimplemented => RetryPeriod::Short,
            },
            Error::Validation { .. } => RetryPeriod::Long,
            Error::Drain { .. } => RetryPeriod::Short,
            Error::Frozen { .. } => RetryPeriod::Long,
            Error::Internal { .. } => RetryPeriod::Medium,
        }
    }

    /// True when the error is an API-server optimistic-concurrency conflict.
    /// Conflicts are normal under contention; callers log at debug and
    /// requeue rather than surfacing a warning event.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }
}
