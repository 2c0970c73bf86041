//! Process-local membership and credential stores, for single-instance
//! control planes and tests.

use std::collections::HashMap;

use anyhow::Result;
use tokio::sync::Mutex;

use crate::application::ports::{CredentialStore, MembershipStore, NodeCredentials};

#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    addresses: Mutex<Vec<String>>,
}

impl InMemoryMembershipStore {
    #[must_use]
    pub fn with_members(addresses: Vec<String>) -> Self {
        Self {
            addresses: Mutex::new(addresses),
        }
    }
}

impl MembershipStore for InMemoryMembershipStore {
    async fn member_addresses(&self) -> Result<Vec<String>> {
        Ok(self.addresses.lock().await.clone())
    }

    async fn set_members(&self, addresses: &[String]) -> Result<()> {
        *self.addresses.lock().await = addresses.to_vec();
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.addresses.lock().await.clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    by_address: Mutex<HashMap<String, NodeCredentials>>,
}

impl CredentialStore for InMemoryCredentialStore {
    async fn node_credentials(&self, address: &str) -> Result<Option<NodeCredentials>> {
        Ok(self.by_address.lock().await.get(address).cloned())
    }

    async fn store_node_credentials(&self, address: &str, creds: &NodeCredentials) -> Result<()> {
        self.by_address
            .lock()
            .await
            .insert(address.to_string(), creds.clone());
        Ok(())
    }
}
