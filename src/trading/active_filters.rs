//! Shared handle to each strategy's active filter set.
//!
//! Readers clone an `Arc<FilterSet>` and keep using it for the whole
//! evaluation; a new set is installed by swapping the pointer, so a
//! reader never sees a half-updated rule list.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::info;

use crate::db::Database;
use crate::models::FilterSet;

#[derive(Clone, Default)]
pub struct ActiveFilters {
    sets: Arc<RwLock<HashMap<String, Arc<FilterSet>>>>,
}

impl ActiveFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, strategy_id: &str) -> Option<Arc<FilterSet>> {
        self.sets.read().await.get(strategy_id).cloned()
    }

    /// Swap in a newly activated set.
    pub async fn install(&self, set: FilterSet) {
        let strategy_id = set.strategy_id.clone();
        self.sets.write().await.insert(strategy_id, Arc::new(set));
    }

    /// Pick up sets activated elsewhere (another process or the CLI).
    pub async fn refresh(&self, db: &Database, strategy_ids: &[String]) -> Result<()> {
        for strategy_id in strategy_ids {
            let Some(stored) = db.get_active_filter_set(strategy_id).await? else {
                continue;
            };

            let current_id = self.get(strategy_id).await.map(|s| s.id);
            if current_id != Some(stored.id) {
                info!(
                    strategy = %strategy_id,
                    filter_set_id = stored.id,
                    version = stored.version,
                    rules = stored.rules.len(),
                    "Active filter set loaded"
                );
                self.install(stored).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Feature, FilterRule};

    #[tokio::test]
    async fn test_refresh_follows_storage_pointer() {
        let db = Database::in_memory().await.unwrap();
        let filters = ActiveFilters::new();
        let strategies = vec!["s1".to_string()];

        filters.refresh(&db, &strategies).await.unwrap();
        assert!(filters.get("s1").await.is_none());

        db.activate_filter_set("s1", "v1", &[FilterRule::new(Feature::SpreadPct, 0, 0.0, 1.0)], None)
            .await
            .unwrap();
        filters.refresh(&db, &strategies).await.unwrap();
        let held = filters.get("s1").await.unwrap();
        assert_eq!(held.version, 1);

        db.activate_filter_set("s1", "v2", &[], None).await.unwrap();
        filters.refresh(&db, &strategies).await.unwrap();
        assert_eq!(filters.get("s1").await.unwrap().version, 2);

        // A reader holding the old set keeps a consistent view
        assert_eq!(held.rules.len(), 1);
    }
}
