//! Bearer credentials supplied by the authentication collaborator.

use async_trait::async_trait;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tideline_common::Result;

/// Bearer token attached to every remote call. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Credential for remotes that do not check tokens.
    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED; {} bytes])", self.0.len())
    }
}

/// Source of bearer credentials.
///
/// Refresh is opaque to the sync engine: after a call fails with
/// `Unauthenticated` it calls [`CredentialProvider::refresh`] once and
/// retries with the returned credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current credential.
    async fn credential(&self) -> Result<Credential>;

    /// Obtain a fresh credential.
    async fn refresh(&self) -> Result<Credential>;
}

/// Provider that always returns the same token.
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            credential: Credential::anonymous(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }

    async fn refresh(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}
