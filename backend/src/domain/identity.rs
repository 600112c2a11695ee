//! Identifier newtypes shared across the pipeline.
//!
//! Row identifiers (`CreationId`, `TrialId`, …) wrap the storage layer's
//! auto-incrementing integers; user identities are UUIDs and anonymous
//! clients carry an opaque string handed out by the session layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap an existing UUID.
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a new random [`UserId`].
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID.
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier of an anonymous trial client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

/// Validation errors returned by [`ClientId::new`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientIdValidationError {
    /// Identifier is empty after trimming whitespace.
    #[error("client id must not be empty")]
    Empty,
    /// Identifier collides with the reserved pool identity.
    #[error("client id is reserved")]
    Reserved,
}

/// Reserved identity that owns background pool-refill trial rows.
const POOL_CLIENT_ID: &str = "trial-pool";

impl ClientId {
    /// Validate and construct a client identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, ClientIdValidationError> {
        let raw = value.into();
        if raw.trim().is_empty() {
            return Err(ClientIdValidationError::Empty);
        }
        // Only `pool()` may mint the pool identity; a session-layer id must
        // never collide with it.
        if raw.trim() == POOL_CLIENT_ID {
            return Err(ClientIdValidationError::Reserved);
        }
        Ok(Self(raw))
    }

    /// The reserved identity used for background pool refills.
    pub fn pool() -> Self {
        Self(POOL_CLIENT_ID.to_owned())
    }

    /// Whether this is the reserved pool identity.
    pub fn is_pool(&self) -> bool {
        self.0 == POOL_CLIENT_ID
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(i64);

        impl $name {
            /// Wrap a storage row identifier.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The underlying integer value.
            pub const fn value(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

row_id! {
    /// Identifier of an authenticated creation row.
    CreationId
}

row_id! {
    /// Identifier of an anonymous trial creation row.
    TrialId
}

row_id! {
    /// Identifier of a trial request link row.
    TrialRequestId
}

row_id! {
    /// Identifier of an external generation provider.
    ProviderId
}

#[cfg(test)]
mod tests {
    //! Regression coverage for this module.

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn client_id_rejects_blank(#[case] value: &str) {
        let err = ClientId::new(value).expect_err("blank ids rejected");
        assert_eq!(err, ClientIdValidationError::Empty);
    }

    #[test]
    fn pool_identity_is_recognised() {
        assert!(ClientId::pool().is_pool());
        let other = ClientId::new("visitor-17").expect("valid id");
        assert!(!other.is_pool());
    }

    #[rstest]
    #[case("trial-pool")]
    #[case("  trial-pool  ")]
    fn client_id_rejects_the_reserved_pool_value(#[case] value: &str) {
        let err = ClientId::new(value).expect_err("reserved id rejected");
        assert_eq!(err, ClientIdValidationError::Reserved);
    }

    #[test]
    fn row_ids_expose_their_value() {
        let id = CreationId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(id.to_string(), "42");
    }
}
