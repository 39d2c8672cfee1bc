//! API keys and the tenant boundary.
//!
//! Keys are opaque `sr_`-prefixed values. Validation increments the usage
//! counter atomically in the store. The boundary itself is enforced at the
//! change engine and approval gateway: a caller touching another tenant's
//! change sees `NotFound`, never `Forbidden`.

use crate::errors::{CoreError, CoreResult};
use crate::store::Store;
use crate::types::{ApiKeyRecord, Change};
use base64::Engine;
use rand::RngCore;
use std::sync::Arc;

/// Generates an opaque API key: `sr_` + 32 random urlsafe-base64 bytes.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!(
        "sr_{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Tenant registry over the store.
#[derive(Clone)]
pub struct Tenants {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Tenants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenants").finish_non_exhaustive()
    }
}

impl Tenants {
    /// Creates the registry.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Issues a key for an email.
    pub async fn register(&self, email: &str) -> CoreResult<ApiKeyRecord> {
        if email.is_empty() || !email.contains('@') {
            return Err(CoreError::bad_request("email is invalid"));
        }
        self.store.create_api_key(email).await
    }

    /// Validates a key, counting the use. Unknown or inactive keys are
    /// `Unauthorized`.
    pub async fn authenticate(&self, api_key: &str) -> CoreResult<ApiKeyRecord> {
        self.store
            .validate_api_key(api_key)
            .await?
            .ok_or_else(|| CoreError::unauthorized("invalid API key"))
    }

    /// Loads key info without counting a use.
    pub async fn lookup(&self, api_key: &str) -> CoreResult<Option<ApiKeyRecord>> {
        self.store.get_api_key(api_key).await
    }
}

/// Enforces change ownership for a caller. Cross-tenant access reports the
/// change as missing.
pub fn check_ownership(change: &Change, caller_api_key: &str) -> CoreResult<()> {
    match change.api_key.as_deref() {
        Some(owner) if owner == caller_api_key => Ok(()),
        None => Ok(()),
        Some(_) => Err(CoreError::not_found("change not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("sr_"));
        // 32 bytes urlsafe-base64 without padding is 43 characters.
        assert_eq!(key.len(), 3 + 43);
        assert_ne!(key, generate_api_key());
    }

    #[test]
    fn test_ownership_mismatch_is_not_found() {
        let mut change = crate::mocks::sample_change("c-1");
        change.api_key = Some("sr_alice".to_string());

        assert!(check_ownership(&change, "sr_alice").is_ok());
        let err = check_ownership(&change, "sr_bob").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_unowned_change_is_accessible() {
        let change = crate::mocks::sample_change("c-2");
        assert!(check_ownership(&change, "sr_anyone").is_ok());
    }
}
