/// Default implementation for a Repository that factors out common
/// query patterns / SQL queries between Postgres and SQLite.
///
/// Usage:
///
/// The struct has to have certain fields, since this macro relies on them:
///
/// ```ignore
/// pub struct MyRepository {
///     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>
/// }
///
/// impl MyRepository {
///     pub const MIGRATOR: sqlx::Migrator = sqlx::migrate!("my/migrations");
///     pub fn interpret_error(error: sqlx::Error) -> Error {
///         // Interpret the database-specific error code and turn some sqlx errors
///         // into the Error enum values like UniqueConstraintViolation/FKConstraintViolation
///         // ...
///     }
/// }
///
/// implement_repository!(SqliteRepository)
/// ```
///
/// Both backends accept the same statements: `$n` placeholders, partial unique indexes
/// over live rows (`WHERE deleted_at = 0`) and `ON CONFLICT ... DO UPDATE` targeting them.
/// Table names are interpolated from closed enums, never from caller input.
use super::interface::{MetaTable, PrincipalKind};

pub(crate) const META_COLUMNS: &str =
    "id, parent_id, name, comment, properties, audit_info, details, current_version";
pub(crate) const PRINCIPAL_COLUMNS: &str = "id, metalake_id, name, audit_info, current_version";
pub(crate) const ROLE_COLUMNS: &str =
    "id, metalake_id, name, properties, audit_info, current_version";
pub(crate) const SECURABLE_OBJECT_COLUMNS: &str =
    "entity_id, object_type, privilege_names, privilege_conditions";

/// Statements tombstoning a metadata row and everything beneath it, children first.
/// Each binds `$1` to the tombstone timestamp and `$2` to the row id; the last one
/// targets the row itself.
pub(crate) fn soft_delete_meta_statements(table: MetaTable) -> Vec<String> {
    let mut statements = vec![];

    let schemas_of = |catalog_filter: &str| {
        format!(
            "SELECT id FROM schema_meta WHERE deleted_at = 0 AND parent_id IN ({catalog_filter})"
        )
    };

    let (leaf_parents, schema_parents, catalog_parents) = match table {
        MetaTable::Metalake => {
            let catalogs =
                "SELECT id FROM catalog_meta WHERE deleted_at = 0 AND parent_id = $2".to_string();
            (Some(schemas_of(&catalogs)), Some(catalogs), Some("$2".to_string()))
        }
        MetaTable::Catalog => (Some(schemas_of("$2")), Some("$2".to_string()), None),
        MetaTable::Schema => (Some("$2".to_string()), None, None),
        MetaTable::Table | MetaTable::Topic | MetaTable::Fileset => (None, None, None),
    };

    if let Some(parents) = leaf_parents {
        for leaf in MetaTable::LEAVES {
            statements.push(format!(
                "UPDATE {leaf} SET deleted_at = $1 WHERE deleted_at = 0 AND parent_id IN ({parents})"
            ));
        }
    }
    if let Some(parents) = schema_parents {
        statements.push(format!(
            "UPDATE schema_meta SET deleted_at = $1 WHERE deleted_at = 0 AND parent_id IN ({parents})"
        ));
    }
    if let Some(parents) = catalog_parents {
        statements.push(format!(
            "UPDATE catalog_meta SET deleted_at = $1 WHERE deleted_at = 0 AND parent_id IN ({parents})"
        ));
    }

    if table == MetaTable::Metalake {
        for kind in [PrincipalKind::User, PrincipalKind::Group] {
            statements.push(format!(
                "UPDATE {rel} SET deleted_at = $1 WHERE deleted_at = 0 AND {col} IN \
                 (SELECT id FROM {meta} WHERE deleted_at = 0 AND metalake_id = $2)",
                rel = kind.rel_table(),
                col = kind.id_column(),
                meta = kind.meta_table(),
            ));
        }
        statements.push(
            "UPDATE role_meta_securable_object SET deleted_at = $1 WHERE deleted_at = 0 AND role_id IN \
             (SELECT id FROM role_meta WHERE deleted_at = 0 AND metalake_id = $2)"
                .to_string(),
        );
        for meta in ["user_meta", "group_meta", "role_meta"] {
            statements.push(format!(
                "UPDATE {meta} SET deleted_at = $1 WHERE deleted_at = 0 AND metalake_id = $2"
            ));
        }
    }

    statements.push(format!(
        "UPDATE {table} SET deleted_at = $1 WHERE deleted_at = 0 AND id = $2"
    ));
    statements
}

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident) => {
#[async_trait]
impl Repository for $repo {
    async fn setup(&self) {
        $repo::MIGRATOR
            .run(&self.executor)
            .await
            .expect("error running migrations");
    }

    async fn get_meta(
        &self,
        table: MetaTable,
        parent_id: EntityId,
        name: &str,
    ) -> Result<MetaRecord, Error> {
        let sql = format!(
            "SELECT {META_COLUMNS} FROM {table} WHERE parent_id = $1 AND name = $2 AND deleted_at = 0"
        );
        let record = sqlx::query_as(&sql)
            .bind(parent_id)
            .bind(name)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(record)
    }

    async fn get_meta_by_id(&self, table: MetaTable, id: EntityId) -> Result<MetaRecord, Error> {
        let sql = format!("SELECT {META_COLUMNS} FROM {table} WHERE id = $1 AND deleted_at = 0");
        let record = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(record)
    }

    async fn list_meta(
        &self,
        table: MetaTable,
        parent_id: EntityId,
    ) -> Result<Vec<MetaRecord>, Error> {
        let sql = format!(
            "SELECT {META_COLUMNS} FROM {table} WHERE parent_id = $1 AND deleted_at = 0 ORDER BY name"
        );
        let records = sqlx::query_as(&sql)
            .bind(parent_id)
            .fetch(&self.executor)
            .try_collect()
            .await.map_err($repo::interpret_error)?;

        Ok(records)
    }

    async fn insert_meta(&self, table: MetaTable, record: &MetaRecord) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO {table} ({META_COLUMNS}, deleted_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)"
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(record.parent_id)
            .bind(&record.name)
            .bind(&record.comment)
            .bind(&record.properties)
            .bind(&record.audit_info)
            .bind(&record.details)
            .bind(record.current_version)
            .execute(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn upsert_meta(&self, table: MetaTable, record: &MetaRecord) -> Result<(), Error> {
        let sql = format!(
            r#"INSERT INTO {table} ({META_COLUMNS}, deleted_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)
            ON CONFLICT (parent_id, name) WHERE deleted_at = 0 DO UPDATE SET
                comment = excluded.comment,
                properties = excluded.properties,
                audit_info = excluded.audit_info,
                details = excluded.details,
                current_version = {table}.current_version + 1"#
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(record.parent_id)
            .bind(&record.name)
            .bind(&record.comment)
            .bind(&record.properties)
            .bind(&record.audit_info)
            .bind(&record.details)
            .bind(record.current_version)
            .execute(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn update_meta(
        &self,
        table: MetaTable,
        record: &MetaRecord,
        expected_version: Version,
    ) -> Result<u64, Error> {
        let sql = format!(
            r#"UPDATE {table} SET
                name = $1, comment = $2, properties = $3, audit_info = $4, details = $5,
                current_version = $6
            WHERE id = $7 AND current_version = $8 AND deleted_at = 0"#
        );
        let updated = sqlx::query(&sql)
            .bind(&record.name)
            .bind(&record.comment)
            .bind(&record.properties)
            .bind(&record.audit_info)
            .bind(&record.details)
            .bind(record.current_version)
            .bind(record.id)
            .bind(expected_version)
            .execute(&self.executor)
            .await.map_err($repo::interpret_error)?
            .rows_affected();

        Ok(updated)
    }

    async fn soft_delete_meta(&self, table: MetaTable, id: EntityId) -> Result<u64, Error> {
        let now = now_millis();
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        let mut deleted = 0;
        for statement in soft_delete_meta_statements(table) {
            deleted = sqlx::query(&statement)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?
                .rows_affected();
        }

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(deleted)
    }

    async fn get_principal(
        &self,
        kind: PrincipalKind,
        metalake_id: EntityId,
        name: &str,
    ) -> Result<PrincipalRecord, Error> {
        let sql = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM {} WHERE metalake_id = $1 AND name = $2 AND deleted_at = 0",
            kind.meta_table()
        );
        let record = sqlx::query_as(&sql)
            .bind(metalake_id)
            .bind(name)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(record)
    }

    async fn list_principals(
        &self,
        kind: PrincipalKind,
        metalake_id: EntityId,
    ) -> Result<Vec<PrincipalRecord>, Error> {
        let sql = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM {} WHERE metalake_id = $1 AND deleted_at = 0 ORDER BY name",
            kind.meta_table()
        );
        let records = sqlx::query_as(&sql)
            .bind(metalake_id)
            .fetch(&self.executor)
            .try_collect()
            .await.map_err($repo::interpret_error)?;

        Ok(records)
    }

    async fn insert_principal(
        &self,
        kind: PrincipalKind,
        record: &PrincipalRecord,
    ) -> Result<(), Error> {
        let sql = format!(
            "INSERT INTO {} ({PRINCIPAL_COLUMNS}, deleted_at) VALUES ($1, $2, $3, $4, $5, 0)",
            kind.meta_table()
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(record.metalake_id)
            .bind(&record.name)
            .bind(&record.audit_info)
            .bind(record.current_version)
            .execute(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(())
    }

    async fn soft_delete_principal(
        &self,
        kind: PrincipalKind,
        id: EntityId,
    ) -> Result<u64, Error> {
        let now = now_millis();
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        let sql = format!(
            "UPDATE {} SET deleted_at = $1 WHERE {} = $2 AND deleted_at = 0",
            kind.rel_table(),
            kind.id_column()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await.map_err($repo::interpret_error)?;

        let sql = format!(
            "UPDATE {} SET deleted_at = $1 WHERE id = $2 AND deleted_at = 0",
            kind.meta_table()
        );
        let deleted = sqlx::query(&sql)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await.map_err($repo::interpret_error)?
            .rows_affected();

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(deleted)
    }

    async fn update_principal_roles(
        &self,
        kind: PrincipalKind,
        id: EntityId,
        expected_version: Version,
        audit_info: &str,
        add: &[RoleId],
        remove: &[RoleId],
    ) -> Result<(), Error> {
        let now = now_millis();
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        let sql = format!(
            r#"UPDATE {} SET audit_info = $1, current_version = current_version + 1
            WHERE id = $2 AND current_version = $3 AND deleted_at = 0"#,
            kind.meta_table()
        );
        let updated = sqlx::query(&sql)
            .bind(audit_info)
            .bind(id)
            .bind(expected_version)
            .execute(&mut *tx)
            .await.map_err($repo::interpret_error)?
            .rows_affected();
        if updated == 0 {
            // Dropping the transaction rolls it back
            return Err(Error::SqlxError(sqlx::Error::RowNotFound));
        }

        if !add.is_empty() {
            let mut builder: QueryBuilder<_> = QueryBuilder::new(format!(
                "INSERT INTO {} ({}, role_id, deleted_at) ",
                kind.rel_table(),
                kind.id_column()
            ));
            builder.push_values(add, |mut b, role_id| {
                b.push_bind(id).push_bind(*role_id).push_bind(0_i64);
            });
            builder.build()
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;
        }

        let sql = format!(
            "UPDATE {} SET deleted_at = $1 WHERE {} = $2 AND role_id = $3 AND deleted_at = 0",
            kind.rel_table(),
            kind.id_column()
        );
        for role_id in remove {
            sqlx::query(&sql)
                .bind(now)
                .bind(id)
                .bind(*role_id)
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;
        }

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(())
    }

    async fn get_role(&self, metalake_id: EntityId, name: &str) -> Result<RoleRecord, Error> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM role_meta WHERE metalake_id = $1 AND name = $2 AND deleted_at = 0"
        );
        let record = sqlx::query_as(&sql)
            .bind(metalake_id)
            .bind(name)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(record)
    }

    async fn list_roles_by_principal(
        &self,
        kind: PrincipalKind,
        principal_id: EntityId,
    ) -> Result<Vec<RoleRecord>, Error> {
        let sql = format!(
            r#"SELECT r.id, r.metalake_id, r.name, r.properties, r.audit_info, r.current_version
            FROM role_meta r
            INNER JOIN {rel} rel ON r.id = rel.role_id
            WHERE rel.{col} = $1 AND rel.deleted_at = 0 AND r.deleted_at = 0
            ORDER BY r.name"#,
            rel = kind.rel_table(),
            col = kind.id_column(),
        );
        let records = sqlx::query_as(&sql)
            .bind(principal_id)
            .fetch(&self.executor)
            .try_collect()
            .await.map_err($repo::interpret_error)?;

        Ok(records)
    }

    async fn list_securable_objects(
        &self,
        role_id: RoleId,
    ) -> Result<Vec<SecurableObjectRecord>, Error> {
        let sql = format!(
            r#"SELECT {SECURABLE_OBJECT_COLUMNS} FROM role_meta_securable_object
            WHERE role_id = $1 AND deleted_at = 0 ORDER BY id"#
        );
        let records = sqlx::query_as(&sql)
            .bind(role_id)
            .fetch(&self.executor)
            .try_collect()
            .await.map_err($repo::interpret_error)?;

        Ok(records)
    }

    async fn insert_role(
        &self,
        role: &RoleRecord,
        objects: &[SecurableObjectRecord],
        overwrite: bool,
    ) -> Result<RoleId, Error> {
        let now = now_millis();
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        let existing: Option<RoleId> = if overwrite {
            sqlx::query("SELECT id FROM role_meta WHERE metalake_id = $1 AND name = $2 AND deleted_at = 0")
                .bind(role.metalake_id)
                .bind(&role.name)
                .fetch_optional(&mut *tx)
                .await.map_err($repo::interpret_error)?
                .map(|row| row.try_get("id"))
                .transpose()
                .map_err($repo::interpret_error)?
        } else {
            None
        };

        let role_id = match existing {
            Some(role_id) => {
                sqlx::query(
                    r#"UPDATE role_meta SET properties = $1, audit_info = $2,
                    current_version = current_version + 1 WHERE id = $3"#,
                )
                .bind(&role.properties)
                .bind(&role.audit_info)
                .bind(role_id)
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;

                sqlx::query(
                    "UPDATE role_meta_securable_object SET deleted_at = $1 WHERE role_id = $2 AND deleted_at = 0",
                )
                .bind(now)
                .bind(role_id)
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;

                role_id
            }
            None => {
                let sql = format!(
                    "INSERT INTO role_meta ({ROLE_COLUMNS}, deleted_at) VALUES ($1, $2, $3, $4, $5, $6, 0)"
                );
                sqlx::query(&sql)
                    .bind(role.id)
                    .bind(role.metalake_id)
                    .bind(&role.name)
                    .bind(&role.properties)
                    .bind(&role.audit_info)
                    .bind(role.current_version)
                    .execute(&mut *tx)
                    .await.map_err($repo::interpret_error)?;

                role.id
            }
        };

        if !objects.is_empty() {
            let mut builder: QueryBuilder<_> = QueryBuilder::new(format!(
                "INSERT INTO role_meta_securable_object (role_id, {SECURABLE_OBJECT_COLUMNS}, deleted_at) "
            ));
            builder.push_values(objects, |mut b, object| {
                b.push_bind(role_id)
                    .push_bind(object.entity_id)
                    .push_bind(&object.object_type)
                    .push_bind(&object.privilege_names)
                    .push_bind(&object.privilege_conditions)
                    .push_bind(0_i64);
            });
            builder.build()
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;
        }

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(role_id)
    }

    async fn soft_delete_role(&self, role_id: RoleId) -> Result<u64, Error> {
        let now = now_millis();
        let mut tx = self.executor.begin().await.map_err($repo::interpret_error)?;

        for table in ["user_role_rel", "group_role_rel", "role_meta_securable_object"] {
            let sql = format!(
                "UPDATE {table} SET deleted_at = $1 WHERE role_id = $2 AND deleted_at = 0"
            );
            sqlx::query(&sql)
                .bind(now)
                .bind(role_id)
                .execute(&mut *tx)
                .await.map_err($repo::interpret_error)?;
        }

        let deleted = sqlx::query(
            "UPDATE role_meta SET deleted_at = $1 WHERE id = $2 AND deleted_at = 0",
        )
        .bind(now)
        .bind(role_id)
        .execute(&mut *tx)
        .await.map_err($repo::interpret_error)?
        .rows_affected();

        tx.commit().await.map_err($repo::interpret_error)?;
        Ok(deleted)
    }

    async fn hard_delete_legacy(
        &self,
        table: StoreTable,
        cutoff: Timestamp,
        limit: i64,
    ) -> Result<u64, Error> {
        let sql = format!(
            r#"DELETE FROM {table} WHERE id IN (
                SELECT id FROM {table} WHERE deleted_at > 0 AND deleted_at < $1 LIMIT $2
            )"#
        );
        let deleted = sqlx::query(&sql)
            .bind(cutoff)
            .bind(limit)
            .execute(&self.executor)
            .await.map_err($repo::interpret_error)?
            .rows_affected();

        Ok(deleted)
    }
}
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_delete_visits_children_first() {
        let statements = soft_delete_meta_statements(MetaTable::Catalog);
        assert_eq!(statements.len(), 5);
        assert!(statements[0].starts_with("UPDATE table_meta"));
        assert!(statements[3].starts_with("UPDATE schema_meta"));
        assert!(statements[4].starts_with("UPDATE catalog_meta"));
        assert!(statements[4].ends_with("id = $2"));

        let statements = soft_delete_meta_statements(MetaTable::Topic);
        assert_eq!(
            statements,
            vec!["UPDATE topic_meta SET deleted_at = $1 WHERE deleted_at = 0 AND id = $2"]
        );

        let statements = soft_delete_meta_statements(MetaTable::Metalake);
        assert!(statements.last().unwrap().starts_with("UPDATE metalake_meta"));
        assert!(statements.iter().any(|s| s.starts_with("UPDATE role_meta ")));
    }
}
