//! Key-prefixing wrapper so independently configured stores can share one
//! physical backend without colliding.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{validate_key, StorageAdapter};
use crate::value::StateValue;

/// Wraps another adapter and stores every key as `"{namespace}:{key}"`.
///
/// Enumeration only returns keys inside the namespace (with the prefix
/// stripped) and `clear` only removes those keys.
pub struct NamespacedAdapter {
    inner: Arc<dyn StorageAdapter>,
    prefix: String,
}

impl NamespacedAdapter {
    /// Create a namespaced view over `inner`.
    pub fn new(inner: Arc<dyn StorageAdapter>, namespace: impl AsRef<str>) -> Self {
        Self {
            inner,
            prefix: format!("{}:", namespace.as_ref()),
        }
    }

    /// The prefix applied to every key, including the trailing `:`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn physical(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }
}

#[async_trait]
impl StorageAdapter for NamespacedAdapter {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<StateValue>> {
        self.inner.get(&self.physical(key)?).await
    }

    async fn set(&self, key: &str, value: &StateValue) -> Result<()> {
        self.inner.set(&self.physical(key)?, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&self.physical(key)?).await
    }

    async fn clear(&self) -> Result<()> {
        for key in self.inner.get_all_keys().await? {
            if key.starts_with(&self.prefix) {
                self.inner.remove(&key).await?;
            }
        }
        Ok(())
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .get_all_keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.inner.has(&self.physical(key)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;
    use serde_json::json;

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let physical = MemoryAdapter::new();
        let main = NamespacedAdapter::new(Arc::new(physical.clone()), "main");
        let popout = NamespacedAdapter::new(Arc::new(physical.clone()), "popout");

        main.set("ui.theme", &json!("dark")).await.unwrap();
        popout.set("ui.theme", &json!("light")).await.unwrap();

        assert_eq!(main.get("ui.theme").await.unwrap(), Some(json!("dark")));
        assert_eq!(popout.get("ui.theme").await.unwrap(), Some(json!("light")));
        assert_eq!(
            physical.get_all_keys().await.unwrap(),
            vec!["main:ui.theme", "popout:ui.theme"]
        );
    }

    #[tokio::test]
    async fn test_clear_only_touches_namespace() {
        let physical = MemoryAdapter::new();
        physical.set("unrelated", &json!(1)).await.unwrap();

        let ns = NamespacedAdapter::new(Arc::new(physical.clone()), "app");
        ns.set("a", &json!(1)).await.unwrap();
        ns.set("b", &json!(2)).await.unwrap();
        assert_eq!(ns.get_all_keys().await.unwrap(), vec!["a", "b"]);

        ns.clear().await.unwrap();
        assert!(ns.get_all_keys().await.unwrap().is_empty());
        assert!(physical.has("unrelated").await.unwrap());
    }
}
