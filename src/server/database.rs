use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{query, query_as, query_scalar, FromRow};
use std::sync::Arc;
use tracing::error;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "postgres")]
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::errors::{LicenseError, LicenseResult};
use crate::license::LicenseRecord;
use crate::store::{InstallOutcome, LicenseStore};

/// A row of the `licenses` table.
#[derive(Debug, Clone, FromRow)]
pub struct LicenseRow {
    pub license_key: String,
    pub max_concurrent_sessions: i64,
    pub expires_at: Option<NaiveDateTime>,
    pub active: bool,
    pub install_limit: Option<i64>,
    pub activated_at: Option<NaiveDateTime>,
    pub validity_secs: Option<i64>,
    pub created_at: NaiveDateTime,
}

impl TryFrom<LicenseRow> for LicenseRecord {
    type Error = LicenseError;

    fn try_from(row: LicenseRow) -> Result<Self, Self::Error> {
        let max_concurrent_sessions = u32::try_from(row.max_concurrent_sessions)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                LicenseError::InvalidRecord(format!(
                    "max_concurrent_sessions must be positive, got {}",
                    row.max_concurrent_sessions
                ))
            })?;

        let install_limit = row
            .install_limit
            .map(|n| {
                u32::try_from(n).map_err(|_| {
                    LicenseError::InvalidRecord(format!("install_limit out of range: {n}"))
                })
            })
            .transpose()?;
        let validity_secs = row
            .validity_secs
            .map(|n| {
                u64::try_from(n).map_err(|_| {
                    LicenseError::InvalidRecord(format!("validity_secs out of range: {n}"))
                })
            })
            .transpose()?;

        Ok(LicenseRecord {
            key: row.license_key,
            max_concurrent_sessions,
            expires_at: row.expires_at.map(|dt| dt.and_utc()),
            active: row.active,
            install_limit,
            activated_at: row.activated_at.map(|dt| dt.and_utc()),
            validity_secs,
        })
    }
}

/// Unified database abstraction over SQLite and Postgres.
///
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `Database::SQLite`
/// - `postgres` feature enables `Database::Postgres`
#[derive(Debug, Clone)]
pub enum Database {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl Database {
    /// Connect to the configured SQL backend.
    pub async fn connect(db_config: &DatabaseConfig) -> LicenseResult<Arc<Self>> {
        match db_config.db_type.as_str() {
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = SqlitePool::connect(&db_config.sqlite_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to SQLite: {e}");
                        LicenseError::StoreError(format!("failed to connect to SQLite: {e}"))
                    })?;

                Ok(Arc::new(Database::SQLite(pool)))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(LicenseError::ConfigError(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPool::connect(&db_config.postgres_url)
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to PostgreSQL: {e}");
                        LicenseError::StoreError(format!("failed to connect to PostgreSQL: {e}"))
                    })?;

                Ok(Arc::new(Database::Postgres(pool)))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(LicenseError::ConfigError(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(LicenseError::ConfigError(format!(
                "unsupported SQL database type: {other}"
            ))),
        }
    }

    /// Create the `licenses` and `license_installs` tables if they do not
    /// exist yet.
    pub async fn migrate(&self) -> LicenseResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                for statement in [
                    r#"
                    CREATE TABLE IF NOT EXISTS licenses (
                        license_key             TEXT PRIMARY KEY,
                        max_concurrent_sessions INTEGER NOT NULL CHECK (max_concurrent_sessions > 0),
                        expires_at              TEXT,
                        active                  BOOLEAN NOT NULL DEFAULT 1,
                        install_limit           INTEGER,
                        activated_at            TEXT,
                        validity_secs           INTEGER,
                        created_at              TEXT NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS license_installs (
                        license_key TEXT NOT NULL,
                        fingerprint TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        PRIMARY KEY (license_key, fingerprint)
                    )
                    "#,
                ] {
                    query(statement).execute(pool).await.map_err(|e| {
                        error!("SQLite migrate failed: {e}");
                        LicenseError::StoreError(format!("database error: {e}"))
                    })?;
                }
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                for statement in [
                    r#"
                    CREATE TABLE IF NOT EXISTS licenses (
                        license_key             TEXT PRIMARY KEY,
                        max_concurrent_sessions BIGINT NOT NULL CHECK (max_concurrent_sessions > 0),
                        expires_at              TIMESTAMP,
                        active                  BOOLEAN NOT NULL DEFAULT TRUE,
                        install_limit           BIGINT,
                        activated_at            TIMESTAMP,
                        validity_secs           BIGINT,
                        created_at              TIMESTAMP NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS license_installs (
                        license_key TEXT NOT NULL,
                        fingerprint TEXT NOT NULL,
                        created_at  TIMESTAMP NOT NULL,
                        PRIMARY KEY (license_key, fingerprint)
                    )
                    "#,
                ] {
                    query(statement).execute(pool).await.map_err(|e| {
                        error!("Postgres migrate failed: {e}");
                        LicenseError::StoreError(format!("database error: {e}"))
                    })?;
                }
            }
        }

        Ok(())
    }

    /// Insert a license record or update an existing one.
    ///
    /// Used to seed records; license administration itself lives elsewhere.
    pub async fn insert_license(&self, record: &LicenseRecord) -> LicenseResult<()> {
        let now = Utc::now().naive_utc();
        let expires_at = record.expires_at.map(|dt| dt.naive_utc());
        let max_sessions = i64::from(record.max_concurrent_sessions);
        let install_limit = record.install_limit.map(i64::from);
        let activated_at = record.activated_at.map(|dt| dt.naive_utc());
        let validity_secs = record
            .validity_secs
            .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX));

        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    r#"
                    INSERT INTO licenses (
                        license_key,
                        max_concurrent_sessions,
                        expires_at,
                        active,
                        install_limit,
                        activated_at,
                        validity_secs,
                        created_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(license_key) DO UPDATE SET
                        max_concurrent_sessions = excluded.max_concurrent_sessions,
                        expires_at              = excluded.expires_at,
                        active                  = excluded.active,
                        install_limit           = excluded.install_limit,
                        activated_at            = excluded.activated_at,
                        validity_secs           = excluded.validity_secs
                    "#,
                )
                .bind(&record.key)
                .bind(max_sessions)
                .bind(expires_at)
                .bind(record.active)
                .bind(install_limit)
                .bind(activated_at)
                .bind(validity_secs)
                .bind(now)
                .execute(pool)
                .await
                .map_err(|e| {
                    error!("SQLite insert_license failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    r#"
                    INSERT INTO licenses (
                        license_key,
                        max_concurrent_sessions,
                        expires_at,
                        active,
                        install_limit,
                        activated_at,
                        validity_secs,
                        created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (license_key) DO UPDATE SET
                        max_concurrent_sessions = EXCLUDED.max_concurrent_sessions,
                        expires_at              = EXCLUDED.expires_at,
                        active                  = EXCLUDED.active,
                        install_limit           = EXCLUDED.install_limit,
                        activated_at            = EXCLUDED.activated_at,
                        validity_secs           = EXCLUDED.validity_secs
                    "#,
                )
                .bind(&record.key)
                .bind(max_sessions)
                .bind(expires_at)
                .bind(record.active)
                .bind(install_limit)
                .bind(activated_at)
                .bind(validity_secs)
                .bind(now)
                .execute(pool)
                .await
                .map_err(|e| {
                    error!("Postgres insert_license failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })?;
            }
        }

        Ok(())
    }

    /// Set the revocation flag of a license.
    ///
    /// Returns:
    /// - `Ok(true)` if a row was updated
    /// - `Ok(false)` if the key is unknown
    pub async fn set_active(&self, license_key: &str, active: bool) -> LicenseResult<bool> {
        let rows_affected = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query("UPDATE licenses SET active = ? WHERE license_key = ?")
                .bind(active)
                .bind(license_key)
                .execute(pool)
                .await
                .map_err(|e| {
                    error!("SQLite set_active failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })?
                .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("UPDATE licenses SET active = $1 WHERE license_key = $2")
                    .bind(active)
                    .bind(license_key)
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        error!("Postgres set_active failed: {e}");
                        LicenseError::StoreError(format!("database error: {e}"))
                    })?
                    .rows_affected()
            }
        };

        Ok(rows_affected > 0)
    }

    /// Fetch a raw license row by key.
    pub async fn get_license_row(&self, license_key: &str) -> LicenseResult<Option<LicenseRow>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as::<_, LicenseRow>(
                    "SELECT license_key, max_concurrent_sessions, expires_at, active, install_limit, \
                     activated_at, validity_secs, created_at \
                     FROM licenses WHERE license_key = ?",
                )
                .bind(license_key)
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    error!("SQLite get_license failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, LicenseRow>(
                    "SELECT license_key, max_concurrent_sessions, expires_at, active, install_limit, \
                     activated_at, validity_secs, created_at \
                     FROM licenses WHERE license_key = $1",
                )
                .bind(license_key)
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    error!("Postgres get_license failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })
            }
        }
    }

    /// Insert an installation row unless `limit` rows already exist for the key.
    ///
    /// Count and insert run as one statement. SQLite serializes writers; on
    /// Postgres the license row is locked first so racing installs for the
    /// same key queue up. Returns whether a row was inserted.
    async fn insert_install(
        &self,
        license_key: &str,
        fingerprint: &str,
        limit: i64,
    ) -> LicenseResult<bool> {
        let now = Utc::now().naive_utc();
        let rows_affected = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                r#"
                INSERT INTO license_installs (license_key, fingerprint, created_at)
                SELECT ?, ?, ?
                WHERE (SELECT COUNT(*) FROM license_installs WHERE license_key = ?) < ?
                ON CONFLICT (license_key, fingerprint) DO NOTHING
                "#,
            )
            .bind(license_key)
            .bind(fingerprint)
            .bind(now)
            .bind(license_key)
            .bind(limit)
            .execute(pool)
            .await
            .map_err(|e| {
                error!("SQLite insert_install failed: {e}");
                LicenseError::StoreError(format!("database error: {e}"))
            })?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let db_err = |e: sqlx::Error| {
                    error!("Postgres insert_install failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                };
                let mut tx = pool.begin().await.map_err(db_err)?;
                query("SELECT 1 FROM licenses WHERE license_key = $1 FOR UPDATE")
                    .bind(license_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                let inserted = query(
                    r#"
                    INSERT INTO license_installs (license_key, fingerprint, created_at)
                    SELECT $1::TEXT, $2::TEXT, $3::TIMESTAMP
                    WHERE (SELECT COUNT(*) FROM license_installs WHERE license_key = $1) < $4::BIGINT
                    ON CONFLICT (license_key, fingerprint) DO NOTHING
                    "#,
                )
                .bind(license_key)
                .bind(fingerprint)
                .bind(now)
                .bind(limit)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?
                .rows_affected();
                tx.commit().await.map_err(db_err)?;
                inserted
            }
        };

        Ok(rows_affected > 0)
    }

    async fn install_known(&self, license_key: &str, fingerprint: &str) -> LicenseResult<bool> {
        let found = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_scalar::<_, i64>(
                "SELECT 1 FROM license_installs WHERE license_key = ? AND fingerprint = ?",
            )
            .bind(license_key)
            .bind(fingerprint)
            .fetch_optional(pool)
            .await
            .map_err(|e| {
                error!("SQLite install_known failed: {e}");
                LicenseError::StoreError(format!("database error: {e}"))
            })?,
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_scalar::<_, i32>(
                "SELECT 1 FROM license_installs WHERE license_key = $1 AND fingerprint = $2",
            )
            .bind(license_key)
            .bind(fingerprint)
            .fetch_optional(pool)
            .await
            .map_err(|e| {
                error!("Postgres install_known failed: {e}");
                LicenseError::StoreError(format!("database error: {e}"))
            })?
            .map(i64::from),
        };

        Ok(found.is_some())
    }

    pub fn db_type(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => "postgres",
        }
    }
}

#[async_trait]
impl LicenseStore for Database {
    async fn get_license(&self, key: &str) -> LicenseResult<Option<LicenseRecord>> {
        self.get_license_row(key)
            .await?
            .map(LicenseRecord::try_from)
            .transpose()
    }

    async fn register_install(
        &self,
        key: &str,
        fingerprint: &str,
        limit: Option<u32>,
    ) -> LicenseResult<InstallOutcome> {
        if self.install_known(key, fingerprint).await? {
            return Ok(InstallOutcome::Known);
        }

        let limit = limit.map_or(i64::MAX, i64::from);
        if self.insert_install(key, fingerprint, limit).await? {
            return Ok(InstallOutcome::Registered);
        }

        // Nothing inserted: either the limit was hit or a racing request bound
        // the same fingerprint first.
        if self.install_known(key, fingerprint).await? {
            Ok(InstallOutcome::Known)
        } else {
            Ok(InstallOutcome::LimitReached)
        }
    }

    async fn install_count(&self, key: &str) -> LicenseResult<u32> {
        let count = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM license_installs WHERE license_key = ?",
            )
            .bind(key)
            .fetch_one(pool)
            .await
            .map_err(|e| {
                error!("SQLite install_count failed: {e}");
                LicenseError::StoreError(format!("database error: {e}"))
            })?,
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM license_installs WHERE license_key = $1",
            )
            .bind(key)
            .fetch_one(pool)
            .await
            .map_err(|e| {
                error!("Postgres install_count failed: {e}");
                LicenseError::StoreError(format!("database error: {e}"))
            })?,
        };

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn mark_activated(&self, key: &str, at: DateTime<Utc>) -> LicenseResult<()> {
        let at = at.naive_utc();
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "UPDATE licenses SET activated_at = ? \
                     WHERE license_key = ? AND activated_at IS NULL",
                )
                .bind(at)
                .bind(key)
                .execute(pool)
                .await
                .map_err(|e| {
                    error!("SQLite mark_activated failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "UPDATE licenses SET activated_at = $1 \
                     WHERE license_key = $2 AND activated_at IS NULL",
                )
                .bind(at)
                .bind(key)
                .execute(pool)
                .await
                .map_err(|e| {
                    error!("Postgres mark_activated failed: {e}");
                    LicenseError::StoreError(format!("database error: {e}"))
                })?;
            }
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.db_type()
    }

    async fn ping(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query("SELECT 1").execute(pool).await.is_ok(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query("SELECT 1").execute(pool).await.is_ok(),
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_db() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("db connect failed");
        let db = Database::SQLite(pool);
        db.migrate().await.expect("migrate failed");
        db
    }

    #[tokio::test]
    async fn insert_then_read_back() {
        let db = memory_db().await;
        let expires = Utc::now() + Duration::days(30);
        db.insert_license(&LicenseRecord::new("ABC-1", 2).with_expiry(expires))
            .await
            .unwrap();

        let record = db.get_license("ABC-1").await.unwrap().unwrap();
        assert_eq!(record.max_concurrent_sessions, 2);
        assert!(record.active);
        assert_eq!(
            record.expires_at.map(|d| d.timestamp()),
            Some(expires.timestamp())
        );
        assert!(db.get_license("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revocation_is_visible() {
        let db = memory_db().await;
        db.insert_license(&LicenseRecord::new("ABC-1", 1))
            .await
            .unwrap();

        assert!(db.set_active("ABC-1", false).await.unwrap());
        assert!(!db.set_active("missing", false).await.unwrap());
        assert!(!db.get_license("ABC-1").await.unwrap().unwrap().active);
    }

    #[test]
    fn zero_entitlement_row_is_rejected() {
        let row = LicenseRow {
            license_key: "ZERO".to_string(),
            max_concurrent_sessions: 0,
            expires_at: None,
            active: true,
            install_limit: None,
            activated_at: None,
            validity_secs: None,
            created_at: Utc::now().naive_utc(),
        };
        assert!(matches!(
            LicenseRecord::try_from(row),
            Err(LicenseError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn installs_are_capped_per_key() {
        let db = memory_db().await;
        db.insert_license(&LicenseRecord::new("ABC-1", 5).with_install_limit(2))
            .await
            .unwrap();

        let limit = Some(2);
        assert_eq!(
            db.register_install("ABC-1", "pc-1", limit).await.unwrap(),
            InstallOutcome::Registered
        );
        assert_eq!(
            db.register_install("ABC-1", "pc-2", limit).await.unwrap(),
            InstallOutcome::Registered
        );
        assert_eq!(
            db.register_install("ABC-1", "pc-3", limit).await.unwrap(),
            InstallOutcome::LimitReached
        );
        assert_eq!(
            db.register_install("ABC-1", "pc-2", limit).await.unwrap(),
            InstallOutcome::Known
        );
        assert_eq!(db.install_count("ABC-1").await.unwrap(), 2);

        let record = db.get_license("ABC-1").await.unwrap().unwrap();
        assert_eq!(record.install_limit, Some(2));
    }

    #[tokio::test]
    async fn activation_is_stamped_once() {
        let db = memory_db().await;
        db.insert_license(&LicenseRecord::new("ABC-1", 1).with_validity(86_400))
            .await
            .unwrap();

        let first = Utc::now() - Duration::hours(3);
        db.mark_activated("ABC-1", first).await.unwrap();
        db.mark_activated("ABC-1", Utc::now()).await.unwrap();

        let record = db.get_license("ABC-1").await.unwrap().unwrap();
        assert_eq!(
            record.activated_at.map(|d| d.timestamp()),
            Some(first.timestamp())
        );
        assert_eq!(record.validity_secs, Some(86_400));
    }

    #[test]
    fn negative_install_limit_row_is_rejected() {
        let row = LicenseRow {
            license_key: "NEG".to_string(),
            max_concurrent_sessions: 1,
            expires_at: None,
            active: true,
            install_limit: Some(-1),
            activated_at: None,
            validity_secs: None,
            created_at: Utc::now().naive_utc(),
        };
        assert!(matches!(
            LicenseRecord::try_from(row),
            Err(LicenseError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn ping_reports_reachable() {
        let db = memory_db().await;
        assert!(db.ping().await);
        assert_eq!(db.backend_name(), "sqlite");
    }
}
