//! The `Reconciler` trait is the seam between the runner and the controllers. The runner owns the
//! work queue, the watches and the worker pool; a `Reconciler` only needs to know how to converge
//! a single object, identified by its `ObjectId`, and which other objects care about changes to a
//! related kind.
pub mod backoff;

use crate::k8s_types::K8sType;
use crate::osb::OsbError;
use crate::resource::ObjectId;
use crate::store::StoreError;

use async_trait::async_trait;
use serde_json::Value;

use std::fmt::{self, Display};
use std::time::Duration;

/// The outcome of a single call to `Reconciler::reconcile`
#[derive(Debug, PartialEq)]
pub enum ReconcileResult {
    /// Nothing left to do until the object changes again
    Done,
    /// Run again after the given delay, regardless of whether the object changes
    RequeueAfter(Duration),
    /// Run again after the key's next rate limited backoff
    RequeueWithBackoff,
    /// The attempt failed. Whether and when it is retried depends on the error's kind
    Failed(ReconcileError),
}

impl ReconcileResult {
    pub fn is_done(&self) -> bool {
        matches!(self, ReconcileResult::Done)
    }
}

impl From<Result<ReconcileResult, ReconcileError>> for ReconcileResult {
    fn from(result: Result<ReconcileResult, ReconcileError>) -> ReconcileResult {
        result.unwrap_or_else(ReconcileResult::Failed)
    }
}

/// Semantic kind of a reconcile failure. The kind, not the message, determines what the runner
/// does with the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The spec is invalid or references something that doesn't exist. Recorded in status and
    /// never retried until the spec changes.
    User,
    /// 5xx, transport errors and timeouts. Retried with backoff.
    Transient,
    /// The broker rejected the request outright, or an async operation failed.
    Permanent,
    /// The outcome at the broker is unknown
    Ambiguous,
    /// A write lost an optimistic concurrency race. The next watch event picks it up.
    StaleWrite,
    /// Corrupt stored state or a bug. Retried with backoff, never marks the object failed.
    Internal,
}

impl ErrorKind {
    /// Whether the runner should requeue the key with a rate limited backoff
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Transient | ErrorKind::Ambiguous | ErrorKind::Internal => true,
            ErrorKind::User | ErrorKind::Permanent | ErrorKind::StaleWrite => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileError {
    pub kind: ErrorKind,
    /// Machine readable, stable across releases
    pub reason: &'static str,
    pub message: String,
}

impl ReconcileError {
    pub fn new(kind: ErrorKind, reason: &'static str, message: impl Into<String>) -> ReconcileError {
        ReconcileError {
            kind,
            reason,
            message: message.into(),
        }
    }

    pub fn user(reason: &'static str, message: impl Into<String>) -> ReconcileError {
        ReconcileError::new(ErrorKind::User, reason, message)
    }

    pub fn transient(reason: &'static str, message: impl Into<String>) -> ReconcileError {
        ReconcileError::new(ErrorKind::Transient, reason, message)
    }

    pub fn permanent(reason: &'static str, message: impl Into<String>) -> ReconcileError {
        ReconcileError::new(ErrorKind::Permanent, reason, message)
    }

    pub fn internal(reason: &'static str, message: impl Into<String>) -> ReconcileError {
        ReconcileError::new(ErrorKind::Internal, reason, message)
    }

    /// Classifies a broker error using the reason that fits the operation being attempted
    pub fn from_osb(reason: &'static str, err: &OsbError) -> ReconcileError {
        let kind = if err.is_retryable() {
            ErrorKind::Transient
        } else if matches!(err, OsbError::AuthConfigMissing(_)) {
            ErrorKind::User
        } else {
            ErrorKind::Permanent
        };
        ReconcileError::new(kind, reason, err.describe())
    }

    pub fn is_stale_write(&self) -> bool {
        self.kind == ErrorKind::StaleWrite
    }
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} error ({}): {}", self.kind, self.reason, self.message)
    }
}

impl std::error::Error for ReconcileError {}

/// Store failures are either lost races or problems the controller can't fix by itself
impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> ReconcileError {
        if err.is_conflict() {
            ReconcileError::new(ErrorKind::StaleWrite, "Conflict", err.to_string())
        } else {
            ReconcileError::internal("StoreError", err.to_string())
        }
    }
}

/// A controller for one resource kind (in either scope). Each call to `reconcile` must leave all
/// of its progress persisted in the store, since the runner is free to drop in-memory state
/// between calls.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs and as a metrics label
    fn name(&self) -> &'static str;

    /// The kinds whose objects are queued by their own `ObjectId`. A cluster scoped kind and its
    /// namespaced twin may both be owned, since their ids never collide.
    fn owned_types(&self) -> Vec<&'static K8sType>;

    /// Kinds whose changes should wake up objects of the owned kinds
    fn related_types(&self) -> Vec<&'static K8sType> {
        Vec::new()
    }

    /// Maps a changed object of a related kind onto the keys that should be reconciled
    async fn keys_for_related(&self, _k8s_type: &'static K8sType, _object: &Value) -> Vec<ObjectId> {
        Vec::new()
    }

    async fn reconcile(&self, key: &ObjectId) -> ReconcileResult;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn osb_errors_are_classified_by_kind() {
        let server_error = OsbError::HttpStatus {
            status: 503,
            error: None,
            description: None,
        };
        let err = ReconcileError::from_osb("ErrorCallingProvision", &server_error);
        assert_eq!(ErrorKind::Transient, err.kind);
        assert!(err.kind.is_retryable());

        let bad_request = OsbError::HttpStatus {
            status: 400,
            error: Some("BadRequest".to_owned()),
            description: None,
        };
        let err = ReconcileError::from_osb("ProvisionCallFailed", &bad_request);
        assert_eq!(ErrorKind::Permanent, err.kind);
        assert!(!err.kind.is_retryable());
        assert!(err.message.contains("BadRequest"));

        let missing = OsbError::AuthConfigMissing("secret not found".to_owned());
        assert_eq!(
            ErrorKind::User,
            ReconcileError::from_osb("ErrorGettingAuthCredentials", &missing).kind
        );
    }

    #[test]
    fn store_conflicts_are_stale_writes() {
        let err: ReconcileError = StoreError::Conflict("rv 3 != 4".to_owned()).into();
        assert!(err.is_stale_write());
        assert!(!err.kind.is_retryable());

        let err: ReconcileError = StoreError::NotFound("x".to_owned()).into();
        assert_eq!(ErrorKind::Internal, err.kind);
    }
}
