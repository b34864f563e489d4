//! Catalog trait and the SQLite implementation.

use crate::error::{CatalogError, CatalogResult};
use crate::repos::{
    CorruptFileRepo, FileRepo, InstanceRepo, LibrarianRepo, ObservationRepo, QueueRepo,
    RemoteInstanceRepo, StoreRepo, TransferRepo,
};
use crate::schema::SCHEMA_SQL;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined catalog trait: the sole owner of persistent state.
#[async_trait]
pub trait Catalog:
    LibrarianRepo
    + StoreRepo
    + ObservationRepo
    + FileRepo
    + InstanceRepo
    + RemoteInstanceRepo
    + TransferRepo
    + QueueRepo
    + CorruptFileRepo
    + Send
    + Sync
{
    /// Apply the schema.
    async fn migrate(&self) -> CatalogResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> CatalogResult<()>;
}

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
}

impl SqliteCatalog {
    /// Open (creating if missing) a catalog database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(CatalogError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        Self::from_options(opts).await
    }

    /// An in-memory catalog for tests.
    pub async fn in_memory() -> CatalogResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(CatalogError::Database)?
            .foreign_keys(true);
        Self::from_options(opts).await
    }

    async fn from_options(opts: SqliteConnectOptions) -> CatalogResult<Self> {
        // SQLite permits limited write concurrency; a single long-lived
        // connection keeps claim/transition updates serial and avoids
        // persistent lock errors. The connection must never be reaped: an
        // in-memory database dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(e: std::io::Error) -> Self {
        CatalogError::Database(sqlx::Error::Io(e))
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn migrate(&self) -> CatalogResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Map a unique-constraint violation onto a conflict with context.
fn map_unique(e: sqlx::Error, conflict: impl FnOnce() -> String) -> CatalogError {
    match &e {
        sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
            CatalogError::Conflict(conflict())
        }
        _ => CatalogError::Database(e),
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::*;
    use archivist_core::{Checksum, QueueItemStatus, TransferStatus};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl LibrarianRepo for SqliteCatalog {
        async fn upsert_librarian(&self, librarian: &NewLibrarian) -> CatalogResult<LibrarianRow> {
            sqlx::query(
                r#"
                INSERT INTO librarians (name, url, auth_token, network_transport, sneakernet_transport, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    url = excluded.url,
                    auth_token = excluded.auth_token,
                    network_transport = excluded.network_transport,
                    sneakernet_transport = excluded.sneakernet_transport
                "#,
            )
            .bind(&librarian.name)
            .bind(&librarian.url)
            .bind(&librarian.auth_token)
            .bind(librarian.network_transport)
            .bind(librarian.sneakernet_transport)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;

            self.get_librarian(&librarian.name).await?.ok_or_else(|| {
                CatalogError::Internal(format!("librarian {} vanished after upsert", librarian.name))
            })
        }

        async fn get_librarian(&self, name: &str) -> CatalogResult<Option<LibrarianRow>> {
            let row = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_librarian_by_id(&self, id: i64) -> CatalogResult<Option<LibrarianRow>> {
            let row = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_librarians(&self) -> CatalogResult<Vec<LibrarianRow>> {
            let rows = sqlx::query_as::<_, LibrarianRow>("SELECT * FROM librarians ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn set_transfers_enabled(
            &self,
            name: &str,
            enabled: bool,
            now: OffsetDateTime,
        ) -> CatalogResult<()> {
            let disabled_since: Option<OffsetDateTime> = if enabled { None } else { Some(now) };
            let result = sqlx::query(
                r#"
                UPDATE librarians
                SET transfers_enabled = ?,
                    disabled_since = CASE WHEN ? THEN NULL ELSE COALESCE(disabled_since, ?) END
                WHERE name = ?
                "#,
            )
            .bind(enabled)
            .bind(enabled)
            .bind(disabled_since)
            .bind(name)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("librarian {name}")));
            }
            Ok(())
        }

        async fn mark_librarian_seen(&self, name: &str, now: OffsetDateTime) -> CatalogResult<()> {
            sqlx::query("UPDATE librarians SET last_seen_at = ? WHERE name = ?")
                .bind(now)
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl StoreRepo for SqliteCatalog {
        async fn upsert_store(&self, store: &NewStore) -> CatalogResult<StoreRow> {
            sqlx::query(
                r#"
                INSERT INTO stores (name, backend_kind, root, capacity_bytes, enabled, ingestable, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    backend_kind = excluded.backend_kind,
                    root = excluded.root,
                    capacity_bytes = excluded.capacity_bytes,
                    ingestable = excluded.ingestable
                "#,
            )
            .bind(&store.name)
            .bind(&store.backend_kind)
            .bind(&store.root)
            .bind(store.capacity_bytes)
            .bind(store.enabled)
            .bind(store.ingestable)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;

            self.get_store(&store.name).await?.ok_or_else(|| {
                CatalogError::Internal(format!("store {} vanished after upsert", store.name))
            })
        }

        async fn get_store(&self, name: &str) -> CatalogResult<Option<StoreRow>> {
            let row = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_store_by_id(&self, id: i64) -> CatalogResult<Option<StoreRow>> {
            let row = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_stores(&self) -> CatalogResult<Vec<StoreRow>> {
            let rows = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn set_store_enabled(&self, id: i64, enabled: bool) -> CatalogResult<()> {
            let result = sqlx::query("UPDATE stores SET enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("store id {id}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ObservationRepo for SqliteCatalog {
        async fn create_observation(&self, observation: &ObservationRow) -> CatalogResult<()> {
            if let Some(existing) = self.get_observation(observation.id).await? {
                if existing.julian_date == observation.julian_date
                    && existing.polarization == observation.polarization
                    && existing.length_seconds == observation.length_seconds
                {
                    return Ok(());
                }
                return Err(CatalogError::Conflict(format!(
                    "observation {} already exists with different attributes",
                    observation.id
                )));
            }

            sqlx::query(
                "INSERT INTO observations (id, julian_date, polarization, length_seconds) VALUES (?, ?, ?, ?)",
            )
            .bind(observation.id)
            .bind(observation.julian_date)
            .bind(&observation.polarization)
            .bind(observation.length_seconds)
            .execute(&self.pool)
            .await
            .map_err(|e| map_unique(e, || format!("observation {}", observation.id)))?;
            Ok(())
        }

        async fn get_observation(&self, id: i64) -> CatalogResult<Option<ObservationRow>> {
            let row = sqlx::query_as::<_, ObservationRow>("SELECT * FROM observations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }
    }

    /// Insert an instance and bump the store accounting inside `tx`.
    async fn insert_instance_tx(
        tx: &mut SqliteConnection,
        instance: &NewInstance,
        size_bytes: i64,
    ) -> CatalogResult<InstanceRow> {
        let store = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE id = ?")
            .bind(instance.store_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("store id {}", instance.store_id)))?;

        if !store.enabled {
            return Err(CatalogError::Conflict(format!(
                "store {} is disabled and accepts no new instances",
                store.name
            )));
        }
        if store.used_bytes + size_bytes > store.capacity_bytes {
            return Err(CatalogError::Conflict(format!(
                "store {} over capacity: {} + {} > {}",
                store.name, store.used_bytes, size_bytes, store.capacity_bytes
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO instances (file_name, store_id, path, deletion_policy, created_at, available)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&instance.file_name)
        .bind(instance.store_id)
        .bind(&instance.path)
        .bind(instance.deletion_policy.as_str())
        .bind(instance.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            map_unique(e, || {
                format!("instance at ({}, {})", instance.store_id, instance.path)
            })
        })?;

        sqlx::query("UPDATE stores SET used_bytes = used_bytes + ? WHERE id = ?")
            .bind(size_bytes)
            .bind(instance.store_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM instances WHERE store_id = ? AND path = ?",
        )
        .bind(instance.store_id)
        .bind(&instance.path)
        .fetch_one(&mut *tx)
        .await?;
        Ok(row)
    }

    #[async_trait]
    impl FileRepo for SqliteCatalog {
        async fn create_file(
            &self,
            file: &NewFile,
            instance: Option<&NewInstance>,
        ) -> CatalogResult<()> {
            let mut tx = self.pool.begin().await?;

            let existing =
                sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                    .bind(&file.name)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing {
                Some(row) if row.checksum != file.checksum.to_string() => {
                    return Err(CatalogError::Conflict(format!(
                        "file {} already exists with checksum {}",
                        file.name, row.checksum
                    )));
                }
                Some(_) => {}
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO files (name, source_librarian, size_bytes, checksum, uploaded_at, observation_id)
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&file.name)
                    .bind(&file.source_librarian)
                    .bind(file.size_bytes)
                    .bind(file.checksum.to_string())
                    .bind(file.uploaded_at)
                    .bind(file.observation_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            if let Some(instance) = instance {
                insert_instance_tx(&mut tx, instance, file.size_bytes).await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn get_file(&self, name: &str) -> CatalogResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn delete_file(&self, name: &str) -> CatalogResult<()> {
            let mut tx = self.pool.begin().await?;

            let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CatalogError::NotFound(format!("file {name}")))?;

            // Release byte accounting for the live instances before the
            // rows go away; unavailable ones released theirs already.
            let instances =
                sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE file_name = ?")
                    .bind(name)
                    .fetch_all(&mut *tx)
                    .await?;
            for instance in instances.iter().filter(|i| i.available) {
                sqlx::query("UPDATE stores SET used_bytes = used_bytes - ? WHERE id = ?")
                    .bind(file.size_bytes)
                    .bind(instance.store_id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("DELETE FROM instances WHERE file_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM remote_instances WHERE file_name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM files WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn files_lacking_remote_instance(
            &self,
            librarian_id: i64,
            uploaded_since: OffsetDateTime,
            limit: u32,
        ) -> CatalogResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                r#"
                SELECT f.* FROM files f
                WHERE f.uploaded_at >= ?
                  AND EXISTS (
                      SELECT 1 FROM instances i
                      WHERE i.file_name = f.name AND i.available = 1)
                  AND NOT EXISTS (
                      SELECT 1 FROM remote_instances r
                      WHERE r.file_name = f.name AND r.librarian_id = ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM outgoing_transfers t
                      WHERE t.file_name = f.name AND t.destination_id = ?
                        AND t.status NOT IN ('completed', 'failed', 'cancelled'))
                ORDER BY f.uploaded_at ASC, f.name ASC
                LIMIT ?
                "#,
            )
            .bind(uploaded_since)
            .bind(librarian_id)
            .bind(librarian_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn files_only_on_store(
            &self,
            store_id: i64,
            uploaded_since: OffsetDateTime,
            limit: u32,
        ) -> CatalogResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                r#"
                SELECT f.* FROM files f
                WHERE f.uploaded_at >= ?
                  AND EXISTS (
                      SELECT 1 FROM instances i
                      WHERE i.file_name = f.name AND i.store_id = ? AND i.available = 1)
                  AND NOT EXISTS (
                      SELECT 1 FROM instances o
                      WHERE o.file_name = f.name AND o.store_id != ? AND o.available = 1)
                ORDER BY f.uploaded_at ASC, f.name ASC
                LIMIT ?
                "#,
            )
            .bind(uploaded_since)
            .bind(store_id)
            .bind(store_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl InstanceRepo for SqliteCatalog {
        async fn create_instance(&self, instance: &NewInstance) -> CatalogResult<InstanceRow> {
            let mut tx = self.pool.begin().await?;

            let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                .bind(&instance.file_name)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CatalogError::NotFound(format!("file {}", instance.file_name)))?;

            let row = insert_instance_tx(&mut tx, instance, file.size_bytes).await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_instance(&self, id: i64) -> CatalogResult<Option<InstanceRow>> {
            let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn instances_on_store_since(
            &self,
            store_id: i64,
            since: OffsetDateTime,
        ) -> CatalogResult<Vec<InstanceRow>> {
            let rows = sqlx::query_as::<_, InstanceRow>(
                r#"
                SELECT * FROM instances
                WHERE store_id = ? AND created_at >= ?
                ORDER BY created_at ASC, file_name ASC
                "#,
            )
            .bind(store_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn instances_on_store_older_than(
            &self,
            store_id: i64,
            cutoff: OffsetDateTime,
        ) -> CatalogResult<Vec<InstanceRow>> {
            let rows = sqlx::query_as::<_, InstanceRow>(
                r#"
                SELECT * FROM instances
                WHERE store_id = ? AND created_at <= ? AND available = 1
                ORDER BY created_at ASC, file_name ASC
                "#,
            )
            .bind(store_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn available_instances_for_file(
            &self,
            file_name: &str,
        ) -> CatalogResult<Vec<InstanceRow>> {
            let rows = sqlx::query_as::<_, InstanceRow>(
                "SELECT * FROM instances WHERE file_name = ? AND available = 1 ORDER BY id",
            )
            .bind(file_name)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_instance_unavailable(&self, id: i64) -> CatalogResult<()> {
            let mut tx = self.pool.begin().await?;

            let instance = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CatalogError::NotFound(format!("instance {id}")))?;

            sqlx::query("UPDATE instances SET available = 0 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            if instance.available {
                let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                    .bind(&instance.file_name)
                    .fetch_one(&mut *tx)
                    .await?;
                sqlx::query("UPDATE stores SET used_bytes = used_bytes - ? WHERE id = ?")
                    .bind(file.size_bytes)
                    .bind(instance.store_id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn remove_instance(&self, id: i64) -> CatalogResult<()> {
            let mut tx = self.pool.begin().await?;

            let instance = sqlx::query_as::<_, InstanceRow>("SELECT * FROM instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CatalogError::NotFound(format!("instance {id}")))?;

            sqlx::query("DELETE FROM instances WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            // Unavailable rows already released their accounting.
            if instance.available {
                let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE name = ?")
                    .bind(&instance.file_name)
                    .fetch_one(&mut *tx)
                    .await?;
                sqlx::query("UPDATE stores SET used_bytes = used_bytes - ? WHERE id = ?")
                    .bind(file.size_bytes)
                    .bind(instance.store_id)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn update_instance_checksum_cache(
            &self,
            id: i64,
            checksum: &Checksum,
            size: i64,
            measured_at: OffsetDateTime,
        ) -> CatalogResult<()> {
            sqlx::query(
                r#"
                UPDATE instances
                SET calculated_checksum = ?, calculated_size = ?, checksum_time = ?
                WHERE id = ?
                "#,
            )
            .bind(checksum.to_string())
            .bind(size)
            .bind(measured_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteInstanceRepo for SqliteCatalog {
        async fn register_remote_instance(
            &self,
            file_name: &str,
            librarian_id: i64,
            checksum: &Checksum,
            copy_time: OffsetDateTime,
            sender: &str,
        ) -> CatalogResult<RemoteInstanceRow> {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, RemoteInstanceRow>(
                r#"
                SELECT * FROM remote_instances
                WHERE file_name = ? AND librarian_id = ?
                ORDER BY copy_time DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(file_name)
            .bind(librarian_id)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some(row) => {
                    if let Some(verified) = &row.verified_checksum {
                        if verified != &checksum.to_string() {
                            return Err(CatalogError::Conflict(format!(
                                "remote instance of {file_name} at librarian {librarian_id} \
                                 holds checksum {verified}, refusing to register {checksum}"
                            )));
                        }
                    }
                    sqlx::query(
                        r#"
                        UPDATE remote_instances
                        SET copy_time = ?, last_verified_at = ?, verified_checksum = ?, sender = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(copy_time)
                    .bind(copy_time)
                    .bind(checksum.to_string())
                    .bind(sender)
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                    row.id
                }
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO remote_instances
                            (file_name, librarian_id, copy_time, last_verified_at, verified_checksum, sender)
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(file_name)
                    .bind(librarian_id)
                    .bind(copy_time)
                    .bind(copy_time)
                    .bind(checksum.to_string())
                    .bind(sender)
                    .execute(&mut *tx)
                    .await?;
                    result.last_insert_rowid()
                }
            };

            let row =
                sqlx::query_as::<_, RemoteInstanceRow>("SELECT * FROM remote_instances WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn remote_instances_for_file(
            &self,
            file_name: &str,
        ) -> CatalogResult<Vec<RemoteInstanceRow>> {
            let rows = sqlx::query_as::<_, RemoteInstanceRow>(
                "SELECT * FROM remote_instances WHERE file_name = ? ORDER BY librarian_id, copy_time DESC",
            )
            .bind(file_name)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_remote_verification(
            &self,
            id: i64,
            checksum: &Checksum,
            verified_at: OffsetDateTime,
        ) -> CatalogResult<()> {
            let result = sqlx::query(
                "UPDATE remote_instances SET verified_checksum = ?, last_verified_at = ? WHERE id = ?",
            )
            .bind(checksum.to_string())
            .bind(verified_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("remote instance {id}")));
            }
            Ok(())
        }

        async fn duplicate_remote_instances(&self) -> CatalogResult<Vec<RemoteInstanceRow>> {
            let rows = sqlx::query_as::<_, RemoteInstanceRow>(
                r#"
                SELECT r.* FROM remote_instances r
                WHERE EXISTS (
                    SELECT 1 FROM remote_instances newer
                    WHERE newer.file_name = r.file_name
                      AND newer.librarian_id = r.librarian_id
                      AND (newer.copy_time > r.copy_time
                           OR (newer.copy_time = r.copy_time AND newer.id > r.id))
                )
                ORDER BY r.file_name, r.librarian_id, r.copy_time
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_remote_instance(&self, id: i64) -> CatalogResult<()> {
            sqlx::query("DELETE FROM remote_instances WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn count_verified_remote_copies(
            &self,
            file_name: &str,
            checksum: &Checksum,
        ) -> CatalogResult<u64> {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(DISTINCT librarian_id) FROM remote_instances
                WHERE file_name = ? AND verified_checksum = ?
                "#,
            )
            .bind(file_name)
            .bind(checksum.to_string())
            .fetch_one(&self.pool)
            .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl TransferRepo for SqliteCatalog {
        async fn create_outgoing(
            &self,
            transfer: &NewOutgoingTransfer,
        ) -> CatalogResult<OutgoingTransferRow> {
            let mut tx = self.pool.begin().await?;

            let active = sqlx::query_as::<_, OutgoingTransferRow>(
                r#"
                SELECT * FROM outgoing_transfers
                WHERE file_name = ? AND destination_id = ?
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(&transfer.file_name)
            .bind(transfer.destination_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(active) = active {
                return Err(CatalogError::Conflict(format!(
                    "active outgoing transfer {} already exists for {} -> librarian {}",
                    active.id, transfer.file_name, transfer.destination_id
                )));
            }

            sqlx::query(
                r#"
                INSERT INTO outgoing_transfers
                    (id, file_name, destination_id, source_store_id, status, created_at, updated_at, transport)
                VALUES (?, ?, ?, ?, 'initiated', ?, ?, ?)
                "#,
            )
            .bind(transfer.id)
            .bind(&transfer.file_name)
            .bind(transfer.destination_id)
            .bind(transfer.source_store_id)
            .bind(transfer.created_at)
            .bind(transfer.created_at)
            .bind(transfer.transport.as_str())
            .execute(&mut *tx)
            .await?;

            let row = sqlx::query_as::<_, OutgoingTransferRow>(
                "SELECT * FROM outgoing_transfers WHERE id = ?",
            )
            .bind(transfer.id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn get_outgoing(&self, id: Uuid) -> CatalogResult<Option<OutgoingTransferRow>> {
            let row = sqlx::query_as::<_, OutgoingTransferRow>(
                "SELECT * FROM outgoing_transfers WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_active_outgoing(
            &self,
            file_name: &str,
            destination_id: i64,
        ) -> CatalogResult<Option<OutgoingTransferRow>> {
            let row = sqlx::query_as::<_, OutgoingTransferRow>(
                r#"
                SELECT * FROM outgoing_transfers
                WHERE file_name = ? AND destination_id = ?
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(file_name)
            .bind(destination_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn transition_outgoing(
            &self,
            id: Uuid,
            from: TransferStatus,
            to: TransferStatus,
            updates: &TransferUpdates,
            now: OffsetDateTime,
        ) -> CatalogResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE outgoing_transfers
                SET status = ?, updated_at = ?,
                    remote_transfer_id = COALESCE(?, remote_transfer_id),
                    bytes_transferred = COALESCE(?, bytes_transferred),
                    attempt_count = attempt_count + ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(now)
            .bind(updates.remote_transfer_id)
            .bind(updates.bytes_transferred)
            .bind(if updates.increment_attempts { 1 } else { 0 })
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let row = self.get_outgoing(id).await?;
                return Err(match row {
                    None => CatalogError::NotFound(format!("outgoing transfer {id}")),
                    Some(row) => CatalogError::StaleState {
                        entity: format!("outgoing transfer {id}"),
                        expected: from.as_str().to_string(),
                        found: row.status,
                    },
                });
            }
            Ok(())
        }

        async fn outgoing_by_status(
            &self,
            status: TransferStatus,
        ) -> CatalogResult<Vec<OutgoingTransferRow>> {
            let rows = sqlx::query_as::<_, OutgoingTransferRow>(
                "SELECT * FROM outgoing_transfers WHERE status = ? ORDER BY created_at ASC",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn stale_outgoing(
            &self,
            older_than: OffsetDateTime,
        ) -> CatalogResult<Vec<OutgoingTransferRow>> {
            let rows = sqlx::query_as::<_, OutgoingTransferRow>(
                r#"
                SELECT * FROM outgoing_transfers
                WHERE status NOT IN ('completed', 'failed', 'cancelled') AND created_at < ?
                ORDER BY created_at ASC
                "#,
            )
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn create_incoming(
            &self,
            transfer: &NewIncomingTransfer,
        ) -> CatalogResult<IncomingTransferRow> {
            sqlx::query(
                r#"
                INSERT INTO incoming_transfers
                    (id, file_name, source_librarian_id, store_id, staging_path,
                     declared_size, declared_checksum, observation_id, status,
                     created_at, updated_at, source_transfer_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'initiated', ?, ?, ?)
                "#,
            )
            .bind(transfer.id)
            .bind(&transfer.file_name)
            .bind(transfer.source_librarian_id)
            .bind(transfer.store_id)
            .bind(&transfer.staging_path)
            .bind(transfer.declared_size)
            .bind(transfer.declared_checksum.to_string())
            .bind(transfer.observation_id)
            .bind(transfer.created_at)
            .bind(transfer.created_at)
            .bind(transfer.source_transfer_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                map_unique(e, || {
                    format!(
                        "incoming transfer for source ({}, {})",
                        transfer.source_librarian_id, transfer.source_transfer_id
                    )
                })
            })?;

            self.get_incoming(transfer.id).await?.ok_or_else(|| {
                CatalogError::Internal(format!("incoming transfer {} vanished", transfer.id))
            })
        }

        async fn get_incoming(&self, id: Uuid) -> CatalogResult<Option<IncomingTransferRow>> {
            let row = sqlx::query_as::<_, IncomingTransferRow>(
                "SELECT * FROM incoming_transfers WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_incoming_by_source(
            &self,
            source_librarian_id: i64,
            source_transfer_id: Uuid,
        ) -> CatalogResult<Option<IncomingTransferRow>> {
            let row = sqlx::query_as::<_, IncomingTransferRow>(
                "SELECT * FROM incoming_transfers WHERE source_librarian_id = ? AND source_transfer_id = ?",
            )
            .bind(source_librarian_id)
            .bind(source_transfer_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn transition_incoming(
            &self,
            id: Uuid,
            from: TransferStatus,
            to: TransferStatus,
            updates: &IncomingTransferUpdates,
            now: OffsetDateTime,
        ) -> CatalogResult<()> {
            let result = sqlx::query(
                r#"
                UPDATE incoming_transfers
                SET status = ?, updated_at = ?,
                    store_id = COALESCE(?, store_id),
                    staging_path = COALESCE(?, staging_path)
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(now)
            .bind(updates.store_id)
            .bind(&updates.staging_path)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let row = self.get_incoming(id).await?;
                return Err(match row {
                    None => CatalogError::NotFound(format!("incoming transfer {id}")),
                    Some(row) => CatalogError::StaleState {
                        entity: format!("incoming transfer {id}"),
                        expected: from.as_str().to_string(),
                        found: row.status,
                    },
                });
            }
            Ok(())
        }

        async fn incoming_by_status(
            &self,
            status: TransferStatus,
        ) -> CatalogResult<Vec<IncomingTransferRow>> {
            let rows = sqlx::query_as::<_, IncomingTransferRow>(
                "SELECT * FROM incoming_transfers WHERE status = ? ORDER BY created_at ASC",
            )
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn stale_incoming(
            &self,
            older_than: OffsetDateTime,
        ) -> CatalogResult<Vec<IncomingTransferRow>> {
            let rows = sqlx::query_as::<_, IncomingTransferRow>(
                r#"
                SELECT * FROM incoming_transfers
                WHERE status NOT IN ('completed', 'failed', 'cancelled') AND created_at < ?
                ORDER BY created_at ASC
                "#,
            )
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl QueueRepo for SqliteCatalog {
        async fn enqueue_send(
            &self,
            outgoing_transfer_id: Uuid,
            priority: i64,
            now: OffsetDateTime,
        ) -> CatalogResult<SendQueueItemRow> {
            let result = sqlx::query(
                r#"
                INSERT INTO send_queue (outgoing_transfer_id, priority, enqueued_at, status)
                VALUES (?, ?, ?, 'pending')
                "#,
            )
            .bind(outgoing_transfer_id)
            .bind(priority)
            .bind(now)
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, SendQueueItemRow>("SELECT * FROM send_queue WHERE id = ?")
                .bind(result.last_insert_rowid())
                .fetch_one(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_queue_items(
            &self,
            limit: u32,
            claim_id: Uuid,
            ttl: time::Duration,
            now: OffsetDateTime,
        ) -> CatalogResult<Vec<SendQueueItemRow>> {
            let mut tx = self.pool.begin().await?;

            let candidate_ids: Vec<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM send_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, enqueued_at ASC, id ASC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            let deadline = now + ttl;
            let mut claimed = Vec::with_capacity(candidate_ids.len());
            for id in candidate_ids {
                // Guarded: a contending claimant that won the race leaves
                // rows_affected at zero and we simply skip the item.
                let result = sqlx::query(
                    r#"
                    UPDATE send_queue
                    SET status = 'claimed', claimed_by = ?, claim_deadline = ?
                    WHERE id = ? AND status = 'pending'
                    "#,
                )
                .bind(claim_id)
                .bind(deadline)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() > 0 {
                    claimed.push(id);
                }
            }

            let mut rows = Vec::with_capacity(claimed.len());
            for id in claimed {
                let row =
                    sqlx::query_as::<_, SendQueueItemRow>("SELECT * FROM send_queue WHERE id = ?")
                        .bind(id)
                        .fetch_one(&mut *tx)
                        .await?;
                rows.push(row);
            }

            tx.commit().await?;
            Ok(rows)
        }

        async fn settle_queue_item(&self, id: i64, status: QueueItemStatus) -> CatalogResult<()> {
            if !matches!(status, QueueItemStatus::Done | QueueItemStatus::Failed) {
                return Err(CatalogError::Internal(format!(
                    "queue items settle into done or failed, not {}",
                    status.as_str()
                )));
            }
            let result = sqlx::query(
                "UPDATE send_queue SET status = ?, claimed_by = NULL, claim_deadline = NULL WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("queue item {id}")));
            }
            Ok(())
        }

        async fn release_expired_claims(&self, now: OffsetDateTime) -> CatalogResult<u64> {
            let result = sqlx::query(
                r#"
                UPDATE send_queue
                SET status = 'pending', claimed_by = NULL, claim_deadline = NULL
                WHERE status = 'claimed' AND claim_deadline < ?
                "#,
            )
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }

        async fn claimed_queue_items(&self) -> CatalogResult<Vec<SendQueueItemRow>> {
            let rows = sqlx::query_as::<_, SendQueueItemRow>(
                "SELECT * FROM send_queue WHERE status = 'claimed' ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn queue_item_for_transfer(
            &self,
            outgoing_transfer_id: Uuid,
        ) -> CatalogResult<Option<SendQueueItemRow>> {
            let row = sqlx::query_as::<_, SendQueueItemRow>(
                "SELECT * FROM send_queue WHERE outgoing_transfer_id = ? ORDER BY id DESC LIMIT 1",
            )
            .bind(outgoing_transfer_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl CorruptFileRepo for SqliteCatalog {
        async fn record_corrupt_file(
            &self,
            file_name: &str,
            file_source: &str,
            instance_id: i64,
            detector: &str,
            now: OffsetDateTime,
        ) -> CatalogResult<CorruptFileRow> {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, CorruptFileRow>(
                "SELECT * FROM corrupt_files WHERE instance_id = ?",
            )
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some(row) => {
                    sqlx::query(
                        "UPDATE corrupt_files SET corrupt_count = corrupt_count + 1 WHERE id = ?",
                    )
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                    row.id
                }
                None => {
                    let result = sqlx::query(
                        r#"
                        INSERT INTO corrupt_files (file_name, file_source, instance_id, detected_at, detector)
                        VALUES (?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(file_name)
                    .bind(file_source)
                    .bind(instance_id)
                    .bind(now)
                    .bind(detector)
                    .execute(&mut *tx)
                    .await?;
                    result.last_insert_rowid()
                }
            };

            let row =
                sqlx::query_as::<_, CorruptFileRow>("SELECT * FROM corrupt_files WHERE id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
            tx.commit().await?;
            Ok(row)
        }

        async fn corrupt_files_pending(&self) -> CatalogResult<Vec<CorruptFileRow>> {
            let rows = sqlx::query_as::<_, CorruptFileRow>(
                "SELECT * FROM corrupt_files WHERE replacement_requested = 0 ORDER BY detected_at ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn corrupt_files_awaiting_replacement(&self) -> CatalogResult<Vec<CorruptFileRow>> {
            let rows = sqlx::query_as::<_, CorruptFileRow>(
                "SELECT * FROM corrupt_files WHERE replacement_requested = 1 ORDER BY detected_at ASC",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_replacement_requested(
            &self,
            id: i64,
            repair_transfer_id: Uuid,
        ) -> CatalogResult<()> {
            let result = sqlx::query(
                "UPDATE corrupt_files SET replacement_requested = 1, repair_transfer_id = ? WHERE id = ?",
            )
            .bind(repair_transfer_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("corrupt file {id}")));
            }
            Ok(())
        }

        async fn reset_replacement_request(&self, id: i64) -> CatalogResult<()> {
            let result = sqlx::query(
                "UPDATE corrupt_files SET replacement_requested = 0, repair_transfer_id = NULL WHERE id = ?",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CatalogError::NotFound(format!("corrupt file {id}")));
            }
            Ok(())
        }

        async fn delete_corrupt_file(&self, id: i64) -> CatalogResult<()> {
            sqlx::query("DELETE FROM corrupt_files WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use archivist_core::{Checksum, DeletionPolicy, QueueItemStatus, TransferStatus, Transport};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    async fn catalog() -> SqliteCatalog {
        SqliteCatalog::in_memory().await.unwrap()
    }

    async fn seed_store(catalog: &SqliteCatalog, name: &str, capacity: i64) -> StoreRow {
        catalog
            .upsert_store(&NewStore {
                name: name.to_string(),
                backend_kind: "filesystem".to_string(),
                root: format!("/data/{name}"),
                capacity_bytes: capacity,
                enabled: true,
                ingestable: true,
            })
            .await
            .unwrap()
    }

    async fn seed_librarian(catalog: &SqliteCatalog, name: &str) -> LibrarianRow {
        catalog
            .upsert_librarian(&NewLibrarian {
                name: name.to_string(),
                url: format!("http://{name}.example"),
                auth_token: "secret".to_string(),
                network_transport: true,
                sneakernet_transport: false,
            })
            .await
            .unwrap()
    }

    fn new_file(name: &str, size: i64, uploaded_at: OffsetDateTime) -> NewFile {
        NewFile {
            name: name.to_string(),
            source_librarian: "site-a".to_string(),
            size_bytes: size,
            checksum: Checksum::compute(name.as_bytes()),
            uploaded_at,
            observation_id: None,
        }
    }

    fn new_instance(file: &str, store_id: i64, path: &str) -> NewInstance {
        NewInstance {
            file_name: file.to_string(),
            store_id,
            path: path.to_string(),
            deletion_policy: DeletionPolicy::Allowed,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn create_file_idempotent_on_same_checksum() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 1 << 30).await;
        let now = OffsetDateTime::now_utc();

        let file = new_file("obs1.uvh5", 100, now);
        catalog
            .create_file(&file, Some(&new_instance("obs1.uvh5", store.id, "obs1.uvh5")))
            .await
            .unwrap();

        // Same checksum, no new instance: idempotent.
        catalog.create_file(&file, None).await.unwrap();

        // Different checksum: conflict.
        let mut tampered = file.clone();
        tampered.checksum = Checksum::compute(b"other");
        let err = catalog.create_file(&tampered, None).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[tokio::test]
    async fn instance_accounting_tracks_store_usage() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 250).await;
        let now = OffsetDateTime::now_utc();

        catalog
            .create_file(
                &new_file("f1", 100, now),
                Some(&new_instance("f1", store.id, "f1")),
            )
            .await
            .unwrap();
        assert_eq!(catalog.get_store("primary").await.unwrap().unwrap().used_bytes, 100);

        catalog
            .create_file(
                &new_file("f2", 100, now),
                Some(&new_instance("f2", store.id, "f2")),
            )
            .await
            .unwrap();

        // Third file would exceed capacity.
        let err = catalog
            .create_file(
                &new_file("f3", 100, now),
                Some(&new_instance("f3", store.id, "f3")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        // Removing an instance releases its bytes.
        let instances = catalog.available_instances_for_file("f1").await.unwrap();
        catalog.remove_instance(instances[0].id).await.unwrap();
        assert_eq!(catalog.get_store("primary").await.unwrap().unwrap().used_bytes, 100);
    }

    #[tokio::test]
    async fn duplicate_store_path_rejected() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 1 << 30).await;
        let now = OffsetDateTime::now_utc();

        catalog
            .create_file(
                &new_file("f1", 10, now),
                Some(&new_instance("f1", store.id, "shared/path")),
            )
            .await
            .unwrap();
        catalog.create_file(&new_file("f2", 10, now), None).await.unwrap();

        let err = catalog
            .create_instance(&new_instance("f2", store.id, "shared/path"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[tokio::test]
    async fn disabled_store_accepts_no_instances() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 1 << 30).await;
        catalog.set_store_enabled(store.id, false).await.unwrap();

        let err = catalog
            .create_file(
                &new_file("f1", 10, OffsetDateTime::now_utc()),
                Some(&new_instance("f1", store.id, "f1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_outgoing_is_compare_and_set() {
        let catalog = catalog().await;
        let dest = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        catalog.create_file(&new_file("f1", 10, now), None).await.unwrap();

        let transfer = catalog
            .create_outgoing(&NewOutgoingTransfer {
                id: Uuid::new_v4(),
                file_name: "f1".to_string(),
                destination_id: dest.id,
                source_store_id: None,
                transport: Transport::Network,
                created_at: now,
            })
            .await
            .unwrap();

        catalog
            .transition_outgoing(
                transfer.id,
                TransferStatus::Initiated,
                TransferStatus::Ongoing,
                &TransferUpdates {
                    remote_transfer_id: Some(Uuid::new_v4()),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();

        // A second transition from the old state loses.
        let err = catalog
            .transition_outgoing(
                transfer.id,
                TransferStatus::Initiated,
                TransferStatus::Cancelled,
                &TransferUpdates::default(),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::StaleState { .. }));

        let row = catalog.get_outgoing(transfer.id).await.unwrap().unwrap();
        assert_eq!(row.transfer_status().unwrap(), TransferStatus::Ongoing);
        assert!(row.remote_transfer_id.is_some());
    }

    #[tokio::test]
    async fn active_outgoing_transfer_unique_per_destination() {
        let catalog = catalog().await;
        let dest = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        catalog.create_file(&new_file("f1", 10, now), None).await.unwrap();

        let make = |id| NewOutgoingTransfer {
            id,
            file_name: "f1".to_string(),
            destination_id: dest.id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: now,
        };

        let first = catalog.create_outgoing(&make(Uuid::new_v4())).await.unwrap();
        let err = catalog.create_outgoing(&make(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        // Terminal transfers free the slot.
        catalog
            .transition_outgoing(
                first.id,
                TransferStatus::Initiated,
                TransferStatus::Cancelled,
                &TransferUpdates::default(),
                now,
            )
            .await
            .unwrap();
        catalog.create_outgoing(&make(Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn queue_claim_is_exclusive_and_expires_once() {
        let catalog = catalog().await;
        let dest = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();

        for name in ["f1", "f2", "f3"] {
            catalog.create_file(&new_file(name, 10, now), None).await.unwrap();
            let transfer = catalog
                .create_outgoing(&NewOutgoingTransfer {
                    id: Uuid::new_v4(),
                    file_name: name.to_string(),
                    destination_id: dest.id,
                    source_store_id: None,
                    transport: Transport::Network,
                    created_at: now,
                })
                .await
                .unwrap();
            catalog.enqueue_send(transfer.id, 0, now).await.unwrap();
        }

        let claimant_a = Uuid::new_v4();
        let claimant_b = Uuid::new_v4();
        let claimed_a = catalog
            .claim_queue_items(2, claimant_a, Duration::hours(1), now)
            .await
            .unwrap();
        let claimed_b = catalog
            .claim_queue_items(10, claimant_b, Duration::hours(1), now)
            .await
            .unwrap();

        assert_eq!(claimed_a.len(), 2);
        assert_eq!(claimed_b.len(), 1);
        let ids_a: Vec<i64> = claimed_a.iter().map(|i| i.id).collect();
        assert!(claimed_b.iter().all(|i| !ids_a.contains(&i.id)));

        // Expiry reverts claims to pending exactly once.
        let later = now + Duration::hours(2);
        assert_eq!(catalog.release_expired_claims(later).await.unwrap(), 3);
        assert_eq!(catalog.release_expired_claims(later).await.unwrap(), 0);

        let reclaimed = catalog
            .claim_queue_items(10, claimant_a, Duration::hours(1), later)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 3);
    }

    #[tokio::test]
    async fn queue_items_settle_for_audit() {
        let catalog = catalog().await;
        let dest = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        catalog.create_file(&new_file("f1", 10, now), None).await.unwrap();
        let transfer = catalog
            .create_outgoing(&NewOutgoingTransfer {
                id: Uuid::new_v4(),
                file_name: "f1".to_string(),
                destination_id: dest.id,
                source_store_id: None,
                transport: Transport::Network,
                created_at: now,
            })
            .await
            .unwrap();
        let item = catalog.enqueue_send(transfer.id, 0, now).await.unwrap();

        catalog
            .settle_queue_item(item.id, QueueItemStatus::Done)
            .await
            .unwrap();
        let row = catalog
            .queue_item_for_transfer(transfer.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.item_status().unwrap(), QueueItemStatus::Done);

        // Settling into a non-terminal state is a caller bug.
        assert!(catalog
            .settle_queue_item(item.id, QueueItemStatus::Pending)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remote_instance_upsert_and_conflict() {
        let catalog = catalog().await;
        let peer = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        let checksum = Checksum::compute(b"f1");
        catalog.create_file(&new_file("f1", 10, now), None).await.unwrap();

        let first = catalog
            .register_remote_instance("f1", peer.id, &checksum, now, "site-a")
            .await
            .unwrap();
        let second = catalog
            .register_remote_instance("f1", peer.id, &checksum, now + Duration::minutes(5), "site-a")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            catalog.count_verified_remote_copies("f1", &checksum).await.unwrap(),
            1
        );

        let err = catalog
            .register_remote_instance("f1", peer.id, &Checksum::compute(b"tampered"), now, "site-a")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_remote_instances_keep_latest() {
        let catalog = catalog().await;
        let peer = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        let checksum = Checksum::compute(b"f1");
        catalog.create_file(&new_file("f1", 10, now), None).await.unwrap();

        // Insert duplicates directly, bypassing the upsert, the way drifted
        // peers would have left them.
        for offset in [0i64, 10, 20] {
            sqlx::query(
                r#"
                INSERT INTO remote_instances
                    (file_name, librarian_id, copy_time, last_verified_at, verified_checksum, sender)
                VALUES (?, ?, ?, ?, ?, 'site-a')
                "#,
            )
            .bind("f1")
            .bind(peer.id)
            .bind(now + Duration::minutes(offset))
            .bind(now + Duration::minutes(offset))
            .bind(checksum.to_string())
            .execute(catalog.pool())
            .await
            .unwrap();
        }

        let duplicates = catalog.duplicate_remote_instances().await.unwrap();
        assert_eq!(duplicates.len(), 2);
        for dup in &duplicates {
            catalog.delete_remote_instance(dup.id).await.unwrap();
        }

        let remaining = catalog.remote_instances_for_file("f1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].copy_time, now + Duration::minutes(20));
        assert!(catalog.duplicate_remote_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn files_lacking_remote_instance_ordering_and_exclusions() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 1 << 30).await;
        let peer = seed_librarian(&catalog, "site-b").await;
        let base = OffsetDateTime::now_utc() - Duration::days(1);

        for (name, offset) in [("b-file", 2i64), ("a-file", 2), ("c-file", 1)] {
            catalog
                .create_file(
                    &new_file(name, 10, base + Duration::minutes(offset)),
                    Some(&new_instance(name, store.id, name)),
                )
                .await
                .unwrap();
        }

        // c-file is oldest; a-file beats b-file lexicographically.
        let files = catalog
            .files_lacking_remote_instance(peer.id, base - Duration::days(1), 10)
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["c-file", "a-file", "b-file"]);

        // A registered remote instance excludes the file.
        catalog
            .register_remote_instance(
                "c-file",
                peer.id,
                &Checksum::compute(b"c-file"),
                OffsetDateTime::now_utc(),
                "site-a",
            )
            .await
            .unwrap();
        // An active outgoing transfer excludes the file too.
        catalog
            .create_outgoing(&NewOutgoingTransfer {
                id: Uuid::new_v4(),
                file_name: "a-file".to_string(),
                destination_id: peer.id,
                source_store_id: None,
                transport: Transport::Network,
                created_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        let files = catalog
            .files_lacking_remote_instance(peer.id, base - Duration::days(1), 10)
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b-file"]);
    }

    #[tokio::test]
    async fn files_only_on_store_excludes_already_cloned() {
        let catalog = catalog().await;
        let primary = seed_store(&catalog, "primary", 1 << 30).await;
        let secondary = seed_store(&catalog, "secondary", 1 << 30).await;
        let now = OffsetDateTime::now_utc();

        catalog
            .create_file(
                &new_file("single", 10, now),
                Some(&new_instance("single", primary.id, "single")),
            )
            .await
            .unwrap();
        catalog
            .create_file(
                &new_file("cloned", 10, now),
                Some(&new_instance("cloned", primary.id, "cloned")),
            )
            .await
            .unwrap();
        catalog
            .create_instance(&new_instance("cloned", secondary.id, "cloned"))
            .await
            .unwrap();

        let files = catalog
            .files_only_on_store(primary.id, now - Duration::days(1), 10)
            .await
            .unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["single"]);
    }

    #[tokio::test]
    async fn incoming_transfer_idempotency_key() {
        let catalog = catalog().await;
        let source = seed_librarian(&catalog, "site-b").await;
        let now = OffsetDateTime::now_utc();
        let source_transfer_id = Uuid::new_v4();

        let make = |id| NewIncomingTransfer {
            id,
            file_name: "f1".to_string(),
            source_librarian_id: source.id,
            store_id: None,
            staging_path: None,
            declared_size: 10,
            declared_checksum: Checksum::compute(b"f1"),
            observation_id: None,
            source_transfer_id,
            created_at: now,
        };

        let first = catalog.create_incoming(&make(Uuid::new_v4())).await.unwrap();
        let err = catalog.create_incoming(&make(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict(_)));

        let found = catalog
            .get_incoming_by_source(source.id, source_transfer_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn corrupt_file_repeat_detection_increments() {
        let catalog = catalog().await;
        let store = seed_store(&catalog, "primary", 1 << 30).await;
        let now = OffsetDateTime::now_utc();
        catalog
            .create_file(
                &new_file("f1", 10, now),
                Some(&new_instance("f1", store.id, "f1")),
            )
            .await
            .unwrap();
        let instance = &catalog.available_instances_for_file("f1").await.unwrap()[0];

        let first = catalog
            .record_corrupt_file("f1", "site-a", instance.id, "integrity_check", now)
            .await
            .unwrap();
        assert_eq!(first.corrupt_count, 1);
        assert_eq!(first.file_source, "site-a");
        let second = catalog
            .record_corrupt_file("f1", "site-a", instance.id, "integrity_check", now)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.corrupt_count, 2);

        let repair = Uuid::new_v4();
        catalog.mark_replacement_requested(first.id, repair).await.unwrap();
        assert!(catalog.corrupt_files_pending().await.unwrap().is_empty());
        let awaiting = catalog.corrupt_files_awaiting_replacement().await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].repair_transfer_id, Some(repair));

        catalog.reset_replacement_request(first.id).await.unwrap();
        assert_eq!(catalog.corrupt_files_pending().await.unwrap().len(), 1);
    }
}
