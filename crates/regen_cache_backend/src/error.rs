// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error type shared by the coordination engine and its backends.

use thiserror::Error;

/// Boxed error cause from a collaborator backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error from a cache coordination operation.
///
/// Collaborator failures (`ExternalStore`, `LockService`, `Bus`) are fatal
/// for the call that hit them, never for the process. Backend implementers
/// wrap their transport errors with [`Error::external`], [`Error::lock_service`]
/// or [`Error::bus`]; the original cause stays reachable through
/// [`std::error::Error::source`].
#[derive(Debug, Error)]
pub enum Error {
    /// The user's generation callback failed; carries its error message,
    /// which also traveled to every waiting node in the result notification.
    #[error("value generation failed for key {key}: {message}")]
    GenerationFailed { key: String, message: String },

    /// A success notification arrived but the entry was gone on re-read.
    ///
    /// Seeing this means the entry's lifetime is shorter than the window
    /// between generation and pickup, which points at a misconfigured
    /// regeneration interval or expiry tolerance.
    #[error("generation for key {key} succeeded but the entry had already expired on re-read")]
    GenerationRaced { key: String },

    /// The external key/value store failed.
    #[error("external cache error")]
    ExternalStore(#[source] BoxError),

    /// The distributed lock service failed.
    #[error("distributed lock service error")]
    LockService(#[source] BoxError),

    /// The fan-out bus failed.
    #[error("fan-out bus error")]
    Bus(#[source] BoxError),

    /// A stored entry could not be decoded.
    #[error("stored entry is malformed: {reason}")]
    MalformedEntry { reason: String },

    /// The awaiter channel closed without a notification; only happens while
    /// the manager is being torn down.
    #[error("the notifier for key {key} vanished before completing the awaiter")]
    NotifierVanished { key: String },
}

impl Error {
    /// Wraps an external-store cause.
    pub fn external(cause: impl Into<BoxError>) -> Self {
        Self::ExternalStore(cause.into())
    }

    /// Wraps a lock-service cause.
    pub fn lock_service(cause: impl Into<BoxError>) -> Self {
        Self::LockService(cause.into())
    }

    /// Wraps a bus cause.
    pub fn bus(cause: impl Into<BoxError>) -> Self {
        Self::Bus(cause.into())
    }
}

/// A specialized [`Result`] for cache coordination operations.
pub type Result<T> = std::result::Result<T, Error>;
