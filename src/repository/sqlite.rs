use std::{fmt::Debug, str::FromStr};

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, QueryBuilder, Row, Sqlite,
};

use crate::data_types::{now_millis, EntityId, RoleId, Timestamp, Version};
use crate::implement_repository;

use super::{
    default::{
        soft_delete_meta_statements, META_COLUMNS, PRINCIPAL_COLUMNS, ROLE_COLUMNS,
        SECURABLE_OBJECT_COLUMNS,
    },
    interface::{
        Error, MetaRecord, MetaTable, PrincipalKind, PrincipalRecord, Repository, Result,
        RoleRecord, SecurableObjectRecord, StoreTable,
    },
};

#[derive(Debug)]
pub struct SqliteRepository {
    pub executor: Pool<Sqlite>,
}

impl SqliteRepository {
    pub const MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");

    pub async fn try_new(
        dsn: String,
        journal_mode: SqliteJournalMode,
    ) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&dsn)?
            .create_if_missing(true)
            .journal_mode(journal_mode);

        // Every connection to `sqlite::memory:` opens its own private database
        let mut pool_options = SqlitePoolOptions::new();
        if dsn.contains(":memory:") {
            pool_options = pool_options.max_connections(1);
        }

        let pool = pool_options.connect_with(options).await?;
        let repo = Self { executor: pool };
        repo.setup().await;
        Ok(repo)
    }

    ///
    /// Create a new `SqliteRepository` in read-only mode: assumes the
    /// database already exists and doesn't run migrations. Intended for
    /// replicas that serve authorization checks off a copied metadata file.
    pub async fn try_new_read_only(
        dsn: String,
        journal_mode: SqliteJournalMode,
    ) -> std::result::Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&dsn)?
            .read_only(true)
            .journal_mode(journal_mode);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let repo = Self { executor: pool };
        Ok(repo)
    }

    pub fn interpret_error(error: sqlx::Error) -> Error {
        if let sqlx::Error::Database(ref d) = error {
            // Reference: https://www.sqlite.org/rescode.html
            let message = d.message();

            // For some reason, sqlx doesn't return the proper errcode for FK violations,
            // even though it's calling sqlite3_extended_errcode which is meant to return full codes.
            // Unique constraint violations do return the correct code though.
            if message.contains("FOREIGN KEY constraint failed") {
                return Error::FKConstraintViolation(error);
            }
            if message.contains("UNIQUE constraint failed") {
                return Error::UniqueConstraintViolation(error);
            }
        }
        Error::SqlxError(error)
    }
}

implement_repository!(SqliteRepository);

#[cfg(test)]
mod tests {
    use crate::repository::interface::{MetaRecord, MetaTable, Repository};
    use sqlx::sqlite::SqliteJournalMode;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    use super::super::interface::tests::run_generic_repository_tests;
    use super::SqliteRepository;

    #[tokio::test]
    async fn test_sqlite_repository() {
        let repository = Arc::new(
            SqliteRepository::try_new(
                "sqlite::memory:".to_string(),
                SqliteJournalMode::Wal,
            )
            .await
            .unwrap(),
        );

        run_generic_repository_tests(repository).await;
    }

    #[tokio::test]
    async fn test_sqlite_repository_read_only() {
        // Make a temporary SQLite file in the RW mode, then try
        // reading from it in RO mode

        let temp_file = NamedTempFile::new().unwrap();

        let rw_repository = SqliteRepository::try_new(
            temp_file.path().to_string_lossy().to_string(),
            SqliteJournalMode::Wal,
        )
        .await
        .unwrap();

        let record = MetaRecord {
            id: 7,
            parent_id: 0,
            name: "m".to_string(),
            comment: None,
            properties: "{}".to_string(),
            audit_info: "{}".to_string(),
            details: "null".to_string(),
            current_version: 1,
        };
        rw_repository
            .insert_meta(MetaTable::Metalake, &record)
            .await
            .unwrap();

        let ro_repository = SqliteRepository::try_new_read_only(
            temp_file.path().to_string_lossy().to_string(),
            SqliteJournalMode::Wal,
        )
        .await
        .unwrap();

        assert_eq!(
            ro_repository
                .get_meta(MetaTable::Metalake, 0, "m")
                .await
                .unwrap(),
            record
        );
        assert!(ro_repository
            .insert_meta(MetaTable::Metalake, &MetaRecord { id: 8, name: "n".to_string(), ..record })
            .await
            .is_err());
    }
}
