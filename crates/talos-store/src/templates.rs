//! Application template catalog.

use std::collections::HashMap;

use talos_core::AppTemplate;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Store of shared application templates, keyed by app id with unique slugs.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<HashMap<u32, AppTemplate>>,
}

impl TemplateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a template. The slug must be unique across the catalog.
    pub async fn insert(&self, template: AppTemplate) -> Result<()> {
        let mut templates = self.templates.write().await;
        let slug_taken = templates
            .values()
            .any(|t| t.slug == template.slug && t.app_id != template.app_id);
        if slug_taken {
            return Err(StoreError::TemplateSlugTaken {
                slug: template.slug,
            });
        }
        templates.insert(template.app_id, template);
        Ok(())
    }

    /// Fetches a template by slug.
    pub async fn get_by_slug(&self, slug: &str) -> Result<AppTemplate> {
        let templates = self.templates.read().await;
        templates
            .values()
            .find(|t| t.slug == slug)
            .cloned()
            .ok_or_else(|| StoreError::TemplateNotFound {
                slug: slug.to_string(),
            })
    }

    /// Lists templates ordered by app id.
    pub async fn list(&self) -> Vec<AppTemplate> {
        let templates = self.templates.read().await;
        let mut all: Vec<AppTemplate> = templates.values().cloned().collect();
        all.sort_by_key(|t| t.app_id);
        all
    }
}
