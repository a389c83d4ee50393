//! Identity and session model.
//!
//! An [`Identity`] is an authenticated end user as observed from the identity
//! provider. Identities are immutable once observed: a new `Identity` value
//! always means a new logical session, even when only the display metadata
//! changed. The [`Session`] wraps at most one identity together with its
//! validity state and is owned by the provider; this crate only reads it.

use serde::{Deserialize, Serialize};

/// Opaque identifier for an authenticated user.
///
/// The provider decides the format (the reference deployment uses UUIDs);
/// the core only compares and hashes these.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a user id from its provider-assigned string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An authenticated end-user reference.
///
/// Immutable once observed. Equality is over the whole value: two identities
/// with the same id but different display metadata are distinct logical
/// sessions and force a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Provider-assigned identifier.
    pub id: UserId,
    /// Human-readable name shown in conversation headers.
    pub display_name: String,
    /// Avatar reference, when the user picked one.
    pub avatar_url: Option<String>,
}

impl Identity {
    /// Create an identity with no avatar.
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self { id: id.into(), display_name: display_name.into(), avatar_url: None }
    }

    /// Attach an avatar reference.
    #[must_use]
    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }
}

impl From<&str> for Identity {
    /// Convenience for tests: id doubles as display name.
    fn from(id: &str) -> Self {
        Self::new(id, id)
    }
}

/// Credential presented to the backend on connect.
///
/// # Security
///
/// - **Debug Redaction**: The `Debug` impl redacts the secret to prevent
///   accidental logging of credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialToken {
    secret: String,
}

impl CredentialToken {
    /// Wrap a provider-issued token.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Development token derived from the user id.
    ///
    /// Matches the backend's unauthenticated development mode; never valid
    /// against a production backend.
    pub fn dev(user: &UserId) -> Self {
        Self { secret: format!("dev.{user}") }
    }

    /// The raw secret, for handing to the backend connect call.
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialToken")
            .field("secret", &format!("<redacted {} bytes>", self.secret.len()))
            .finish()
    }
}

/// The current validity/ownership wrapper around an [`Identity`].
///
/// Produced and replaced by the identity provider; read-only to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    /// A user is signed in and the credential is usable for connects.
    Valid {
        /// The authenticated identity.
        identity: Identity,
        /// Credential to present to the backend.
        credential: CredentialToken,
    },
    /// A user was signed in but the session is no longer usable.
    Expired {
        /// The identity the expired session belonged to.
        identity: Identity,
    },
    /// Nobody is signed in.
    Absent,
}

impl Session {
    /// Build a valid session with a development token (test convenience).
    pub fn valid_dev(identity: Identity) -> Self {
        let credential = CredentialToken::dev(&identity.id);
        Self::Valid { identity, credential }
    }

    /// The identity attached to this session, valid or not.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Valid { identity, .. } | Self::Expired { identity } => Some(identity),
            Self::Absent => None,
        }
    }

    /// Identity and credential, only when the session is usable for connects.
    pub fn connectable(&self) -> Option<(&Identity, &CredentialToken)> {
        match self {
            Self::Valid { identity, credential } => Some((identity, credential)),
            Self::Expired { .. } | Self::Absent => None,
        }
    }

    /// Whether this session can open a connection.
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}
