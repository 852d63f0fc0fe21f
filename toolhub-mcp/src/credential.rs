//! Credential store contract consulted at child-process launch time.
//!
//! The store itself (a real OS keychain, a vault client, ...) is an
//! external collaborator; this crate only defines the seam and an
//! in-memory double useful for tests and for declarations that only use
//! literal env values.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::registry::EnvValue;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up `key` in `store`. Returns `None` if the key is absent;
    /// returns `Err` only for a store-level failure (connection refused,
    /// permission denied, ...).
    async fn get(&self, store: &str, key: &str) -> Result<Option<String>, String>;
}

/// An in-memory double. Not a real keychain integration — good for tests
/// and for declarations that never reference `{store, key}` env values.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    values: HashMap<(String, String), String>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, store: impl Into<String>, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert((store.into(), key.into()), value.into());
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, store: &str, key: &str) -> Result<Option<String>, String> {
        Ok(self.values.get(&(store.to_string(), key.to_string())).cloned())
    }
}

/// Resolve a server declaration's `env` map into literal strings, consulting
/// `credentials` for any `{store, key}` reference. Emits one
/// `credential_access` audit event per reference, logged here rather than
/// routed through the audit context (credential resolution runs before any
/// request-scoped context exists — it happens at launch time, never on the
/// hot path).
pub async fn resolve_env(
    env: &HashMap<String, EnvValue>,
    credentials: &dyn CredentialStore,
) -> Result<HashMap<String, String>, String> {
    let mut resolved = HashMap::with_capacity(env.len());
    for (name, value) in env {
        match value {
            EnvValue::Literal(literal) => {
                resolved.insert(name.clone(), literal.clone());
            }
            EnvValue::CredentialRef { store, key } => {
                match credentials.get(store, key).await {
                    Ok(Some(value)) => {
                        info!(
                            event = "credential_access",
                            status = "success",
                            store = %store,
                            key = %key,
                            "resolved credential reference"
                        );
                        resolved.insert(name.clone(), value);
                    }
                    Ok(None) => {
                        warn!(
                            event = "credential_access",
                            status = "not_found",
                            store = %store,
                            key = %key,
                            "credential reference not found"
                        );
                        return Err(format!("credential \"{key}\" not found in store \"{store}\""));
                    }
                    Err(reason) => {
                        error!(
                            event = "credential_access",
                            status = "error",
                            store = %store,
                            key = %key,
                            reason = %reason,
                            "credential store error"
                        );
                        return Err(reason);
                    }
                }
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_values_pass_through() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), EnvValue::Literal("bar".to_string()));
        let store = InMemoryCredentialStore::new();
        let resolved = resolve_env(&env, &store).await.unwrap();
        assert_eq!(resolved.get("FOO").unwrap(), "bar");
    }

    #[tokio::test]
    async fn credential_refs_are_resolved() {
        let mut env = HashMap::new();
        env.insert(
            "API_KEY".to_string(),
            EnvValue::CredentialRef {
                store: "keyring".to_string(),
                key: "api_key".to_string(),
            },
        );
        let mut store = InMemoryCredentialStore::new();
        store.insert("keyring", "api_key", "secret-value");
        let resolved = resolve_env(&env, &store).await.unwrap();
        assert_eq!(resolved.get("API_KEY").unwrap(), "secret-value");
    }

    #[tokio::test]
    async fn missing_credential_is_an_error() {
        let mut env = HashMap::new();
        env.insert(
            "API_KEY".to_string(),
            EnvValue::CredentialRef {
                store: "keyring".to_string(),
                key: "missing".to_string(),
            },
        );
        let store = InMemoryCredentialStore::new();
        assert!(resolve_env(&env, &store).await.is_err());
    }
}
