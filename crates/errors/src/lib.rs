//! Classified errors for the time-series storage layer.
//!
//! An [`ErrorMetadata`] can be attached to an `anyhow` error chain via
//! `.context(e /* ErrorMetadata */)` or raised directly with
//! `anyhow::bail!(..)`. It tags an error with a machine-readable code and a
//! short message that is resilient to changes in copy, so callers and tests
//! can classify failures without string-matching the human-readable text.
use std::borrow::Cow;

/// ErrorMetadata is a generic classified error payload used across the
/// codebase.
///
/// The `msg` is the human-readable, developer-facing description. The
/// `short_msg` is used as a tag - available for tests and metrics - in
/// ScreamingCamelCase, e.g. `TimeFieldMissing`.
///
/// ErrorMetadata is `Clone` so a single failure can be fanned out to every
/// waiter on a shared result channel.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag. Usable in tests for string matching.
    /// Eg TimeFieldMissing
    pub short_msg: Cow<'static, str>,
    /// Human readable - developer facing. Should be longer and descriptive.
    /// Eg "'t' must be present and contain a valid UTC datetime value"
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed input: a missing or mistyped time field, a bad bucket id on
    /// reopen, a metadata mismatch.
    BadValue,
    /// A bucket was cleared while a batch was still open against it. The
    /// batch can no longer commit; the caller should retry against a fresh
    /// bucket.
    BucketCleared,
    /// A direct modification raced with a prepared commit. The caller is
    /// expected to retry its enclosing transaction.
    WriteConflict,
    /// An internal invariant was violated or a resource disappeared out from
    /// under us in a way that is not the caller's fault.
    Internal,
}

impl ErrorMetadata {
    /// Malformed input from the caller.
    ///
    /// The short_msg should be a ScreamingCamelCase tag describing the error
    /// (eg TimeFieldMissing). The msg should be a descriptive message
    /// targeted toward the developer.
    pub fn bad_value(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadValue,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The targeted bucket was cleared while the operation was in flight.
    pub fn bucket_cleared(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::BucketCleared,
            short_msg: BUCKET_CLEARED.into(),
            msg: msg.into(),
        }
    }

    /// A conflicting prepared commit was in flight; the caller should retry.
    pub fn write_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::WriteConflict,
            short_msg: WRITE_CONFLICT.into(),
            msg: msg.into(),
        }
    }

    /// Something went wrong that is not the caller's fault.
    pub fn internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_bad_value(&self) -> bool {
        self.code == ErrorCode::BadValue
    }

    pub fn is_bucket_cleared(&self) -> bool {
        self.code == ErrorCode::BucketCleared
    }

    pub fn is_write_conflict(&self) -> bool {
        self.code == ErrorCode::WriteConflict
    }
}

const BUCKET_CLEARED: &str = "TimeseriesBucketCleared";
const WRITE_CONFLICT: &str = "WriteConflict";

/// Classification helpers for `anyhow::Error` chains that may carry an
/// [`ErrorMetadata`] somewhere in the chain.
pub trait ErrorMetadataAnyhowExt {
    fn is_bad_value(&self) -> bool;
    fn is_bucket_cleared(&self) -> bool;
    fn is_write_conflict(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    /// Returns true if error is tagged as BadValue
    fn is_bad_value(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bad_value();
        }
        false
    }

    /// Returns true if error is tagged as TimeseriesBucketCleared
    fn is_bucket_cleared(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_bucket_cleared();
        }
        false
    }

    /// Returns true if error is tagged as WriteConflict
    fn is_write_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_write_conflict();
        }
        false
    }

    /// Returns the short_msg, or "InternalServerError" if the chain carries
    /// no ErrorMetadata.
    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_SERVER_ERROR
    }

    /// Returns the developer-facing message, or the formatted chain if the
    /// chain carries no ErrorMetadata.
    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_SERVER_ERROR_MSG
    }

    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self {
        match self.downcast::<ErrorMetadata>() {
            Ok(e) => f(e).into(),
            Err(other) => other,
        }
    }
}

const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
const INTERNAL_SERVER_ERROR_MSG: &str = "Internal server error";

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use crate::{
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    #[test]
    fn test_classification_survives_context() {
        let e: anyhow::Error = ErrorMetadata::bad_value("TimeFieldMissing", "no time field").into();
        let e = e.context("while inserting measurement");
        assert!(e.is_bad_value());
        assert!(!e.is_bucket_cleared());
        assert_eq!(e.short_msg(), "TimeFieldMissing");
    }

    #[test]
    fn test_plain_anyhow_is_unclassified() {
        let e = anyhow::anyhow!("plain failure");
        assert!(!e.is_bad_value());
        assert!(!e.is_write_conflict());
        assert_eq!(e.short_msg(), "InternalServerError");
    }

    #[test]
    fn test_map_error_metadata() {
        let e: anyhow::Error = ErrorMetadata::bucket_cleared("bucket was cleared").into();
        let e = e.map_error_metadata(|mut m| {
            m.msg = format!("{} for namespace db.t", m.msg).into();
            m
        });
        assert!(e.is_bucket_cleared());
        assert!(e.msg().contains("db.t"));
    }
}
