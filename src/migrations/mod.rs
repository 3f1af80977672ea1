//! Versioned schema migrations.
//!
//! Migrations are plain SQL files compiled into the binary and applied in version
//! order by a [`MigrationManager`]. Applied migrations are tracked in the
//! `hookwork_migrations` table so each one runs exactly once per database.
//!
//! # Examples
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # async fn run() -> hookwork::Result<()> {
//! use hookwork::migrations::{MigrationManager, postgres::PostgresMigrationRunner};
//!
//! let pool = sqlx::PgPool::connect("postgresql://localhost/hookwork").await?;
//! let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(pool)));
//! manager.run_migrations().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "postgres")]
pub mod postgres;

use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

/// Metadata for one schema migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: String,
    pub description: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

/// A migration that has been applied.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub migration_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Database-specific execution of migrations.
#[async_trait::async_trait]
pub trait MigrationRunner {
    /// Execute a migration's SQL, atomically where the database allows.
    async fn run_migration(&self, migration: &Migration, sql: &str) -> Result<()>;

    async fn migration_table_exists(&self) -> Result<bool>;

    async fn create_migration_table(&self) -> Result<()>;

    async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>>;

    async fn record_migration(&self, migration: &Migration, execution_time_ms: u64) -> Result<()>;
}

pub struct MigrationManager {
    runner: Box<dyn MigrationRunner + Send + Sync>,
    migrations: HashMap<String, (Migration, String)>,
}

impl MigrationManager {
    pub fn new(runner: Box<dyn MigrationRunner + Send + Sync>) -> Self {
        let mut manager = Self {
            runner,
            migrations: HashMap::new(),
        };

        manager.register_builtin_migrations();
        manager
    }

    pub fn register_migration(&mut self, migration: Migration, sql: String) {
        self.migrations
            .insert(migration.id.clone(), (migration, sql));
    }

    /// Apply every registered migration that has not run yet, lowest version first.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Starting migration process...");

        if !self.runner.migration_table_exists().await? {
            info!("Creating migration tracking table...");
            self.runner.create_migration_table().await?;
        }

        let executed_ids = self.executed_ids().await?;

        let mut pending_migrations: Vec<_> = self
            .migrations
            .values()
            .filter(|(migration, _)| !executed_ids.contains(&migration.id))
            .collect();
        pending_migrations.sort_by_key(|(migration, _)| migration.version);

        if pending_migrations.is_empty() {
            info!("No pending migrations to run");
            return Ok(());
        }

        info!("Found {} pending migrations", pending_migrations.len());

        for (migration, sql) in pending_migrations {
            info!(
                "Running migration: {} - {}",
                migration.id, migration.description
            );

            let start_time = std::time::Instant::now();
            self.runner.run_migration(migration, sql).await?;
            let execution_time_ms = start_time.elapsed().as_millis() as u64;

            self.runner
                .record_migration(migration, execution_time_ms)
                .await?;

            info!(
                "Completed migration {} in {}ms",
                migration.id, execution_time_ms
            );
        }

        info!("All migrations completed successfully");
        Ok(())
    }

    /// Every registered migration with whether it has been applied, in version order.
    pub async fn get_migration_status(&self) -> Result<Vec<(Migration, bool)>> {
        let executed_ids = if self.runner.migration_table_exists().await? {
            self.executed_ids().await?
        } else {
            HashSet::new()
        };

        let mut status: Vec<_> = self
            .migrations
            .values()
            .map(|(migration, _)| (migration.clone(), executed_ids.contains(&migration.id)))
            .collect();
        status.sort_by_key(|(migration, _)| migration.version);

        Ok(status)
    }

    async fn executed_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .runner
            .get_executed_migrations()
            .await?
            .into_iter()
            .map(|r| r.migration_id)
            .collect())
    }

    fn register_builtin_migrations(&mut self) {
        let builtin: [(&str, &str, u32, &str); 5] = [
            (
                "001_create_endpoints",
                "Create hookwork_endpoints table",
                1,
                include_str!("sql/001_create_endpoints.sql"),
            ),
            (
                "002_create_deliveries",
                "Create hookwork_deliveries table and retry index",
                2,
                include_str!("sql/002_create_deliveries.sql"),
            ),
            (
                "003_create_rate_limits",
                "Create hookwork_rate_limits counters",
                3,
                include_str!("sql/003_create_rate_limits.sql"),
            ),
            (
                "004_create_incoming",
                "Create hookwork_incoming table with provider event dedup index",
                4,
                include_str!("sql/004_create_incoming.sql"),
            ),
            (
                "005_incoming_claims",
                "Store inbound bodies as bytes, add handler claims and an in-flight delivery index",
                5,
                include_str!("sql/005_incoming_claims.sql"),
            ),
        ];

        let created_at = Utc
            .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        for (id, description, version, sql) in builtin {
            self.register_migration(
                Migration {
                    id: id.to_string(),
                    description: description.to_string(),
                    version,
                    created_at,
                },
                sql.to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingRunner {
        table_exists: Arc<Mutex<bool>>,
        applied: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl MigrationRunner for RecordingRunner {
        async fn run_migration(&self, _migration: &Migration, sql: &str) -> Result<()> {
            assert!(sql.contains("CREATE TABLE"));
            Ok(())
        }

        async fn migration_table_exists(&self) -> Result<bool> {
            Ok(*self.table_exists.lock().unwrap())
        }

        async fn create_migration_table(&self) -> Result<()> {
            *self.table_exists.lock().unwrap() = true;
            Ok(())
        }

        async fn get_executed_migrations(&self) -> Result<Vec<MigrationRecord>> {
            Ok(self
                .applied
                .lock()
                .unwrap()
                .iter()
                .map(|id| MigrationRecord {
                    migration_id: id.clone(),
                    executed_at: Utc::now(),
                    execution_time_ms: 1,
                })
                .collect())
        }

        async fn record_migration(&self, migration: &Migration, _ms: u64) -> Result<()> {
            self.applied.lock().unwrap().push(migration.id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_migrations_run_in_order_once() {
        let runner = RecordingRunner::default();
        let manager = MigrationManager::new(Box::new(runner.clone()));

        let status = manager.get_migration_status().await.unwrap();
        assert_eq!(status.len(), 5);
        assert!(status.iter().all(|(_, applied)| !applied));

        manager.run_migrations().await.unwrap();
        assert_eq!(
            *runner.applied.lock().unwrap(),
            vec![
                "001_create_endpoints",
                "002_create_deliveries",
                "003_create_rate_limits",
                "004_create_incoming",
                "005_incoming_claims",
            ]
        );

        manager.run_migrations().await.unwrap();
        assert_eq!(runner.applied.lock().unwrap().len(), 5);

        let status = manager.get_migration_status().await.unwrap();
        assert!(status.iter().all(|(_, applied)| *applied));
    }

    #[test]
    fn test_builtin_sql_targets_hookwork_tables() {
        let manager = MigrationManager::new(Box::new(RecordingRunner::default()));
        for (migration, sql) in manager.migrations.values() {
            assert!(sql.contains("hookwork_"), "{} has no hookwork table", migration.id);
        }
    }
}
