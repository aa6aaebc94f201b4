use std::sync::Arc;

#[cfg(feature = "metrics")]
use std::net::SocketAddr;

#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::sqlite::SqliteJournalMode;

use crate::catalog::impersonation::PrincipalRunAs;
use crate::context::GovernanceContext;
use crate::error::Result;
use crate::repository::{interface::Repository, sqlite::SqliteRepository};
use crate::store::RandomIdGenerator;

#[cfg(feature = "catalog-postgres")]
use crate::repository::postgres::PostgresRepository;

use super::schema;

async fn build_repository(config: &schema::LakewardConfig) -> Arc<dyn Repository> {
    match &config.store {
        #[cfg(feature = "catalog-postgres")]
        schema::Store::Postgres(schema::Postgres { dsn, schema }) => Arc::new(
            PostgresRepository::try_new(dsn.to_string(), schema.to_string())
                .await
                .expect("Error setting up the database"),
        ),
        schema::Store::Sqlite(schema::Sqlite {
            dsn,
            read_only: false,
        }) => Arc::new(
            SqliteRepository::try_new(dsn.to_string(), SqliteJournalMode::Wal)
                .await
                .expect("Error setting up the database"),
        ),
        schema::Store::Sqlite(schema::Sqlite {
            dsn,
            read_only: true,
        }) => Arc::new(
            SqliteRepository::try_new_read_only(dsn.to_string(), SqliteJournalMode::Wal)
                .await
                .expect("Error setting up the database"),
        ),
    }
}

#[cfg(feature = "metrics")]
pub fn setup_metrics(metrics: &schema::Metrics) {
    let addr: SocketAddr = format!("{}:{}", metrics.host, metrics.port)
        .parse()
        .expect("Error parsing the Prometheus metrics export address");
    let builder = PrometheusBuilder::new().with_http_listener(addr);
    builder
        .install()
        .expect("failed to install recorder/exporter");
}

pub async fn build_context(cfg: schema::LakewardConfig) -> Result<GovernanceContext> {
    let repository = build_repository(&cfg).await;
    GovernanceContext::new(
        cfg,
        repository,
        Arc::new(RandomIdGenerator),
        Arc::new(PrincipalRunAs::default()),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::principal::with_principal;

    #[tokio::test]
    async fn test_config_to_context() {
        let config = schema::LakewardConfig {
            store: schema::Store::Sqlite(schema::Sqlite {
                dsn: "sqlite::memory:".to_string(),
                read_only: false,
            }),
            authorization: schema::Authorization {
                enabled: true,
                service_admins: vec!["admin".to_string()],
                ..Default::default()
            },
            reclamation: schema::Reclamation {
                interval_secs: 0,
                ..Default::default()
            },
            misc: schema::Misc { metrics: None },
        };

        let context = build_context(config).await.unwrap();
        assert!(context.spawn_reclamation().is_none());

        // Only metalake admins may create metalakes, and only service admins name them
        with_principal("admin", context.access_control.add_metalake_admin("alice"))
            .await
            .unwrap();
        let metalake = with_principal(
            "alice",
            context.metalakes.create_metalake("m", None, HashMap::new()),
        )
        .await
        .unwrap();
        assert_eq!(metalake.audit.creator, "alice");
    }
}
