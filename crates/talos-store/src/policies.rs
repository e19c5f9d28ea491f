//! Update-policy store.

use talos_core::policy::select_policy;
use talos_core::UpdatePolicy;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Store of update policies, ordered by creation.
///
/// Creation order matters: when two matching policies tie on specificity,
/// the earlier one wins.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<Vec<UpdatePolicy>>,
}

impl PolicyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new policy or replaces the one with the same id.
    ///
    /// The policy is validated first.
    pub async fn upsert(&self, policy: UpdatePolicy) -> Result<()> {
        policy.validate()?;
        let mut policies = self.policies.write().await;
        if let Some(existing) = policies.iter_mut().find(|p| p.id == policy.id) {
            *existing = policy;
        } else {
            policies.push(policy);
        }
        Ok(())
    }

    /// Fetches a policy by id.
    pub async fn get(&self, id: &str) -> Result<UpdatePolicy> {
        let policies = self.policies.read().await;
        policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StoreError::PolicyNotFound { id: id.to_string() })
    }

    /// Lists all policies in creation order.
    pub async fn list(&self) -> Vec<UpdatePolicy> {
        self.policies.read().await.clone()
    }

    /// Removes a policy by id.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut policies = self.policies.write().await;
        let before = policies.len();
        policies.retain(|p| p.id != id);
        if policies.len() == before {
            return Err(StoreError::PolicyNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Selects the most specific enabled policy matching `image:tag`.
    pub async fn select(&self, image: &str, tag: &str) -> Option<UpdatePolicy> {
        let policies = self.policies.read().await;
        select_policy(policies.iter(), image, tag).cloned()
    }
}
