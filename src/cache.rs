//! Per-process schema cache
//!
//! Empty until the first full catalog read, then served from memory. Any local
//! DDL, a remote schema change or shutdown clears it. Every clear bumps a
//! generation so a catalog read that started before the clear is not cached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::schema::ClassSchema;

#[derive(Debug, Default)]
struct CacheState {
    classes: Option<HashMap<String, ClassSchema>>,
    generation: u64,
}

/// Read-mostly map of class name to normalized schema
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    inner: Arc<RwLock<CacheState>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a full catalog read has been cached
    pub async fn is_loaded(&self) -> bool {
        self.inner.read().await.classes.is_some()
    }

    /// Generation to pass to [`SchemaCache::load`] for a read starting now
    pub async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }

    pub async fn get(&self, class_name: &str) -> Option<ClassSchema> {
        self.inner
            .read()
            .await
            .classes
            .as_ref()
            .and_then(|classes| classes.get(class_name).cloned())
    }

    /// Every cached schema, sorted by class name, if loaded
    pub async fn get_all(&self) -> Option<Vec<ClassSchema>> {
        self.inner.read().await.classes.as_ref().map(|classes| {
            let mut all: Vec<ClassSchema> = classes.values().cloned().collect();
            all.sort_by(|a, b| a.class_name.cmp(&b.class_name));
            all
        })
    }

    /// Cache a full catalog read taken at `generation`
    ///
    /// Returns `false`, caching nothing, when the cache was cleared since.
    pub async fn load(&self, generation: u64, schemas: Vec<ClassSchema>) -> bool {
        let mut state = self.inner.write().await;
        if state.generation != generation {
            tracing::debug!(generation, current = state.generation, "stale schema read not cached");
            return false;
        }
        state.classes = Some(
            schemas
                .into_iter()
                .map(|schema| (schema.class_name.clone(), schema))
                .collect(),
        );
        true
    }

    /// Mark the cache stale after `class_name` changed
    ///
    /// The next full read reloads every class.
    pub async fn invalidate(&self, class_name: &str) {
        tracing::debug!(class = class_name, "schema cache invalidated");
        self.clear().await;
    }

    pub async fn clear(&self) {
        let mut state = self.inner.write().await;
        state.classes = None;
        state.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_until_loaded() {
        let cache = SchemaCache::new();
        assert!(!cache.is_loaded().await);
        assert!(cache.get("Post").await.is_none());
        assert!(cache.get_all().await.is_none());
    }

    #[tokio::test]
    async fn test_load_and_get() {
        let cache = SchemaCache::new();
        let generation = cache.generation().await;
        assert!(
            cache
                .load(
                    generation,
                    vec![ClassSchema::new("Post"), ClassSchema::new("Comment")]
                )
                .await
        );

        assert!(cache.is_loaded().await);
        assert_eq!(cache.get("Post").await.unwrap().class_name, "Post");
        let names: Vec<String> = cache
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.class_name)
            .collect();
        assert_eq!(names, vec!["Comment", "Post"]);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let cache = SchemaCache::new();
        let generation = cache.generation().await;
        cache.load(generation, vec![ClassSchema::new("Post")]).await;
        cache.invalidate("Post").await;
        assert!(!cache.is_loaded().await);
        assert_eq!(cache.generation().await, generation + 1);
    }

    #[tokio::test]
    async fn test_read_started_before_clear_is_not_cached() {
        let cache = SchemaCache::new();
        let generation = cache.generation().await;

        cache.invalidate("Post").await;
        assert!(!cache.load(generation, vec![ClassSchema::new("Post")]).await);
        assert!(!cache.is_loaded().await);

        let generation = cache.generation().await;
        assert!(cache.load(generation, vec![ClassSchema::new("Post")]).await);
        assert!(cache.is_loaded().await);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let cache = SchemaCache::new();
        let other = cache.clone();
        let generation = cache.generation().await;
        cache.load(generation, vec![ClassSchema::new("Post")]).await;
        assert!(other.get("Post").await.is_some());
        other.clear().await;
        assert!(!cache.is_loaded().await);
    }
}
