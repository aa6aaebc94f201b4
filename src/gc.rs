//! Physical removal of soft-deleted rows once they are past their retention period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter};
use strum::IntoEnumIterator;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::data_types::now_millis;
use crate::error::{Error, Result};
use crate::repository::interface::{Repository, StoreTable};
use crate::store::{storage_failure, RoleMetaService};

const RECLAIMED_ROWS: &str = "lakeward_reclaimed_rows_total";

struct ReclamationMetrics {}

impl ReclamationMetrics {
    fn new() -> Self {
        describe_counter!(
            RECLAIMED_ROWS,
            "Soft-deleted rows physically removed by reclamation"
        );
        Self {}
    }

    fn record(&self, table: StoreTable, removed: u64) {
        counter!(RECLAIMED_ROWS, "table" => table.to_string()).increment(removed);
    }
}

pub struct Reclaimer {
    repository: Arc<dyn Repository>,
    roles: RoleMetaService,
    retention: Duration,
    batch_size: i64,
    metrics: ReclamationMetrics,
}

impl Reclaimer {
    pub fn new(
        repository: Arc<dyn Repository>,
        roles: RoleMetaService,
        retention: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            repository,
            roles,
            retention,
            batch_size: batch_size.into(),
            metrics: ReclamationMetrics::new(),
        }
    }

    /// One bounded pass over every table. Returns the number of rows removed per table.
    pub async fn run_once(&self) -> Result<HashMap<StoreTable, u64>> {
        let retention_millis = i64::try_from(self.retention.as_millis())
            .map_err(|_| Error::invalid_argument("Retention period is too long"))?;
        let cutoff = now_millis().saturating_sub(retention_millis);

        let mut counts = self
            .roles
            .delete_role_metas_by_legacy_timeline(cutoff, self.batch_size)
            .await?;
        for table in StoreTable::iter().filter(|t| !t.is_role_table()) {
            let removed = self
                .repository
                .hard_delete_legacy(table, cutoff, self.batch_size)
                .await
                .map_err(storage_failure("reclaim", table))?;
            if removed > 0 {
                info!(%table, removed, "Reclaimed soft-deleted rows");
            }
            counts.insert(table, removed);
        }

        for (table, removed) in &counts {
            self.metrics.record(*table, *removed);
        }
        Ok(counts)
    }

    /// Runs a pass every `interval` until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.run_once().await {
                    warn!("Error reclaiming soft-deleted rows: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use sqlx::sqlite::SqliteJournalMode;

    use super::*;
    use crate::identifier::NameIdentifier;
    use crate::meta::{AuditInfo, EntityType, MetalakeEntity};
    use crate::repository::sqlite::SqliteRepository;
    use crate::store::{EntityStore, RelationalEntityStore};

    #[tokio::test]
    async fn test_reclaims_tombstones_past_retention() {
        let repository: Arc<dyn Repository> = Arc::new(
            SqliteRepository::try_new("sqlite::memory:".to_string(), SqliteJournalMode::Wal)
                .await
                .unwrap(),
        );
        let store = RelationalEntityStore::new(repository.clone());
        for (id, name) in [(1, "m1"), (2, "m2")] {
            store
                .put(
                    MetalakeEntity {
                        id,
                        name: name.to_string(),
                        comment: None,
                        properties: HashMap::new(),
                        audit: AuditInfo::created_by("admin"),
                    }
                    .into(),
                    false,
                )
                .await
                .unwrap();
        }
        store
            .delete(&NameIdentifier::of_metalake("m1"), EntityType::Metalake)
            .await
            .unwrap();

        // Still within the retention period
        let keep = Reclaimer::new(
            repository.clone(),
            store.role_service().clone(),
            Duration::from_secs(3600),
            100,
        );
        assert_eq!(keep.run_once().await.unwrap()[&StoreTable::MetalakeMeta], 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaim = Reclaimer::new(
            repository,
            store.role_service().clone(),
            Duration::ZERO,
            100,
        );
        let counts = reclaim.run_once().await.unwrap();
        assert_eq!(counts[&StoreTable::MetalakeMeta], 1);
        assert_eq!(counts.len(), StoreTable::iter().count());

        // Live rows are untouched
        assert!(store
            .exists(&NameIdentifier::of_metalake("m2"), EntityType::Metalake)
            .await
            .unwrap());
        assert_eq!(reclaim.run_once().await.unwrap()[&StoreTable::MetalakeMeta], 0);
    }
}
