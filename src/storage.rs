//! Durable SM state in SQLite.
//!
//! One database under the working dir holds instances, services, layers,
//! network leases, traffic counters, the journal cursor and env var
//! overrides. Schema changes are numbered migrations applied inside a
//! transaction and tracked via `PRAGMA user_version`; structural changes
//! use create-new-copy-swap so a failed migration leaves the old table
//! intact.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::types::{EnvVarInfo, EnvVarOverrides, InstanceFilter, InstanceIdent, NetworkParameters, RunState};

const DB_NAME: &str = "servicemanager.db";

/// Lifecycle state of an installed service or layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Cached,
    Active,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Cached => "cached",
            ItemState::Active => "active",
        }
    }
}

impl From<&str> for ItemState {
    fn from(s: &str) -> Self {
        match s {
            "cached" => ItemState::Cached,
            "active" => ItemState::Active,
            _ => ItemState::Pending,
        }
    }
}

/// Installed service row.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub service_id: String,
    pub version: String,
    pub provider_id: String,
    pub digest: String,
    pub local_path: String,
    pub size: u64,
    pub gid: u32,
    pub state: ItemState,
    pub timestamp: DateTime<Utc>,
}

/// Installed layer row.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    pub digest: String,
    pub unpacked_digest: String,
    pub layer_id: String,
    pub path: String,
    pub os_version: String,
    pub version: String,
    pub state: ItemState,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

/// Persisted instance row.
#[derive(Debug, Clone)]
pub struct InstanceEntry {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub priority: u64,
    pub storage_path: String,
    pub state_path: String,
    pub network_parameters: NetworkParameters,
    pub run_state: RunState,
    pub exit_code: Option<i32>,
    pub service_version: String,
}

/// Persisted network lease.
#[derive(Debug, Clone)]
pub struct NetworkLease {
    pub network_id: String,
    pub instance_id: String,
    pub ip: String,
    pub vlan_id: u64,
    pub parameters: NetworkParameters,
}

/// Migrations applied in order; `PRAGMA user_version` records how many ran.
const MIGRATIONS: &[&str] = &[
    // 0: initial schema
    r#"
    CREATE TABLE services (
        service_id TEXT NOT NULL,
        version TEXT NOT NULL,
        provider_id TEXT NOT NULL DEFAULT '',
        digest TEXT NOT NULL,
        local_path TEXT NOT NULL,
        size INTEGER NOT NULL,
        gid INTEGER NOT NULL,
        state TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (service_id, version)
    );
    CREATE TABLE layers (
        digest TEXT PRIMARY KEY,
        layer_id TEXT NOT NULL,
        path TEXT NOT NULL,
        os_version TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL,
        size INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE TABLE instances (
        service_id TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        instance INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        storage_path TEXT NOT NULL DEFAULT '',
        state_path TEXT NOT NULL DEFAULT '',
        network_parameters TEXT NOT NULL DEFAULT '{}',
        run_state TEXT NOT NULL DEFAULT 'stopped',
        exit_code INTEGER,
        service_version TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (service_id, subject_id, instance)
    );
    CREATE TABLE network_leases (
        network_id TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        ip TEXT NOT NULL,
        vlan_id INTEGER NOT NULL DEFAULT 0,
        parameters TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (network_id, instance_id)
    );
    CREATE TABLE traffic_counters (
        chain TEXT NOT NULL,
        period TEXT NOT NULL,
        value INTEGER NOT NULL,
        PRIMARY KEY (chain, period)
    );
    CREATE TABLE journal_cursor (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        cursor TEXT
    );
    CREATE TABLE env_var_overrides (
        filter TEXT PRIMARY KEY,
        variables TEXT NOT NULL
    );
    "#,
    // 1: layers gains unpacked_digest
    r#"
    CREATE TABLE layers_new (
        digest TEXT PRIMARY KEY,
        unpacked_digest TEXT NOT NULL DEFAULT '',
        layer_id TEXT NOT NULL,
        path TEXT NOT NULL,
        os_version TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL,
        size INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );
    INSERT INTO layers_new (digest, layer_id, path, os_version, version, state, size, timestamp)
        SELECT digest, layer_id, path, os_version, version, state, size, timestamp FROM layers;
    DROP TABLE layers;
    ALTER TABLE layers_new RENAME TO layers;
    "#,
];

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(working_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(working_dir).await?;

        let db_path = working_dir.join(DB_NAME);
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        Self::open(&db_url).await
    }

    /// In-memory database for tests.
    pub async fn new_in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn open(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        for (index, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            let mut tx = self.pool.begin().await?;

            sqlx::raw_sql(migration).execute(&mut *tx).await?;
            sqlx::raw_sql(&format!("PRAGMA user_version = {}", index + 1))
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
        }

        Ok(())
    }

    // === Services ===

    pub async fn add_service(&self, entry: &ServiceEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO services (service_id, version, provider_id, digest, local_path, size, gid, state, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.service_id)
        .bind(&entry.version)
        .bind(&entry.provider_id)
        .bind(&entry.digest)
        .bind(&entry.local_path)
        .bind(entry.size as i64)
        .bind(entry.gid as i64)
        .bind(entry.state.as_str())
        .bind(entry.timestamp.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_service(&self, service_id: &str, version: &str) -> Result<Option<ServiceEntry>> {
        let row = sqlx::query("SELECT * FROM services WHERE service_id = ? AND version = ?")
            .bind(service_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_service).transpose()
    }

    pub async fn get_service_by_digest(&self, digest: &str) -> Result<Option<ServiceEntry>> {
        let row = sqlx::query("SELECT * FROM services WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_service).transpose()
    }

    pub async fn get_all_services(&self) -> Result<Vec<ServiceEntry>> {
        let rows = sqlx::query("SELECT * FROM services ORDER BY timestamp")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_service).collect()
    }

    pub async fn set_service_state(
        &self,
        digest: &str,
        state: ItemState,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE services SET state = ?, timestamp = ? WHERE digest = ?")
            .bind(state.as_str())
            .bind(timestamp.timestamp())
            .bind(digest)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("service digest {digest}")));
        }

        Ok(())
    }

    pub async fn remove_service(&self, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM services WHERE digest = ?")
            .bind(digest)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Layers ===

    pub async fn add_layer(&self, entry: &LayerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO layers (digest, unpacked_digest, layer_id, path, os_version, version, state, size, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.digest)
        .bind(&entry.unpacked_digest)
        .bind(&entry.layer_id)
        .bind(&entry.path)
        .bind(&entry.os_version)
        .bind(&entry.version)
        .bind(entry.state.as_str())
        .bind(entry.size as i64)
        .bind(entry.timestamp.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_layer(&self, digest: &str) -> Result<Option<LayerEntry>> {
        let row = sqlx::query("SELECT * FROM layers WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_layer).transpose()
    }

    pub async fn get_all_layers(&self) -> Result<Vec<LayerEntry>> {
        let rows = sqlx::query("SELECT * FROM layers ORDER BY timestamp")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_layer).collect()
    }

    pub async fn set_layer_state(
        &self,
        digest: &str,
        state: ItemState,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE layers SET state = ?, timestamp = ? WHERE digest = ?")
            .bind(state.as_str())
            .bind(timestamp.timestamp())
            .bind(digest)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("layer digest {digest}")));
        }

        Ok(())
    }

    pub async fn remove_layer(&self, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM layers WHERE digest = ?")
            .bind(digest)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Instances ===

    pub async fn add_instance(&self, entry: &InstanceEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO instances
                (service_id, subject_id, instance, uid, priority, storage_path, state_path,
                 network_parameters, run_state, exit_code, service_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.ident.service_id)
        .bind(&entry.ident.subject_id)
        .bind(entry.ident.instance as i64)
        .bind(entry.uid as i64)
        .bind(entry.priority as i64)
        .bind(&entry.storage_path)
        .bind(&entry.state_path)
        .bind(serde_json::to_string(&entry.network_parameters)?)
        .bind(entry.run_state.as_str())
        .bind(entry.exit_code)
        .bind(&entry.service_version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_instance(&self, ident: &InstanceIdent) -> Result<Option<InstanceEntry>> {
        let row = sqlx::query(
            "SELECT * FROM instances WHERE service_id = ? AND subject_id = ? AND instance = ?",
        )
        .bind(&ident.service_id)
        .bind(&ident.subject_id)
        .bind(ident.instance as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_instance).transpose()
    }

    pub async fn get_all_instances(&self) -> Result<Vec<InstanceEntry>> {
        let rows = sqlx::query("SELECT * FROM instances")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_instance).collect()
    }

    pub async fn set_instance_run_state(
        &self,
        ident: &InstanceIdent,
        run_state: RunState,
        exit_code: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE instances SET run_state = ?, exit_code = ?
            WHERE service_id = ? AND subject_id = ? AND instance = ?
            "#,
        )
        .bind(run_state.as_str())
        .bind(exit_code)
        .bind(&ident.service_id)
        .bind(&ident.subject_id)
        .bind(ident.instance as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE service_id = ? AND subject_id = ? AND instance = ?")
            .bind(&ident.service_id)
            .bind(&ident.subject_id)
            .bind(ident.instance as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Network leases ===

    pub async fn add_network_lease(&self, lease: &NetworkLease) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO network_leases (network_id, instance_id, ip, vlan_id, parameters)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&lease.network_id)
        .bind(&lease.instance_id)
        .bind(&lease.ip)
        .bind(lease.vlan_id as i64)
        .bind(serde_json::to_string(&lease.parameters)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_network_lease(
        &self,
        network_id: &str,
        instance_id: &str,
    ) -> Result<Option<NetworkLease>> {
        let row =
            sqlx::query("SELECT * FROM network_leases WHERE network_id = ? AND instance_id = ?")
                .bind(network_id)
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(row_to_lease).transpose()
    }

    pub async fn get_network_leases(&self, network_id: &str) -> Result<Vec<NetworkLease>> {
        let rows = sqlx::query("SELECT * FROM network_leases WHERE network_id = ?")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_lease).collect()
    }

    pub async fn remove_network_lease(&self, network_id: &str, instance_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM network_leases WHERE network_id = ? AND instance_id = ?")
            .bind(network_id)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Traffic counters ===

    pub async fn set_traffic_value(&self, chain: &str, period: &str, value: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO traffic_counters (chain, period, value)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(chain)
        .bind(period)
        .bind(value as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_traffic_value(&self, chain: &str, period: &str) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT value FROM traffic_counters WHERE chain = ? AND period = ?")
            .bind(chain)
            .bind(period)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("value") as u64))
    }

    pub async fn remove_traffic_chain(&self, chain: &str) -> Result<()> {
        sqlx::query("DELETE FROM traffic_counters WHERE chain = ?")
            .bind(chain)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // === Journal cursor ===

    pub async fn set_journal_cursor(&self, cursor: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO journal_cursor (id, cursor) VALUES (0, ?)")
            .bind(cursor)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_journal_cursor(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT cursor FROM journal_cursor WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|r| r.get::<Option<String>, _>("cursor")))
    }

    // === Env var overrides ===

    pub async fn set_env_var_overrides(&self, overrides: &EnvVarOverrides) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM env_var_overrides")
            .execute(&mut *tx)
            .await?;

        for (filter, variables) in overrides {
            sqlx::query("INSERT INTO env_var_overrides (filter, variables) VALUES (?, ?)")
                .bind(serde_json::to_string(filter)?)
                .bind(serde_json::to_string(variables)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    pub async fn get_env_var_overrides(&self) -> Result<EnvVarOverrides> {
        let rows = sqlx::query("SELECT filter, variables FROM env_var_overrides")
            .fetch_all(&self.pool)
            .await?;

        let mut overrides = EnvVarOverrides::new();

        for row in rows {
            let filter: InstanceFilter = serde_json::from_str(&row.get::<String, _>("filter"))?;
            let variables: Vec<EnvVarInfo> =
                serde_json::from_str(&row.get::<String, _>("variables"))?;

            overrides.insert(filter, variables);
        }

        Ok(overrides)
    }
}

fn row_to_service(row: SqliteRow) -> Result<ServiceEntry> {
    Ok(ServiceEntry {
        service_id: row.get("service_id"),
        version: row.get("version"),
        provider_id: row.get("provider_id"),
        digest: row.get("digest"),
        local_path: row.get("local_path"),
        size: row.get::<i64, _>("size") as u64,
        gid: row.get::<i64, _>("gid") as u32,
        state: ItemState::from(row.get::<String, _>("state").as_str()),
        timestamp: timestamp_from_secs(row.get::<i64, _>("timestamp")),
    })
}

fn row_to_layer(row: SqliteRow) -> Result<LayerEntry> {
    Ok(LayerEntry {
        digest: row.get("digest"),
        unpacked_digest: row.get("unpacked_digest"),
        layer_id: row.get("layer_id"),
        path: row.get("path"),
        os_version: row.get("os_version"),
        version: row.get("version"),
        state: ItemState::from(row.get::<String, _>("state").as_str()),
        size: row.get::<i64, _>("size") as u64,
        timestamp: timestamp_from_secs(row.get::<i64, _>("timestamp")),
    })
}

fn row_to_instance(row: SqliteRow) -> Result<InstanceEntry> {
    Ok(InstanceEntry {
        ident: InstanceIdent {
            service_id: row.get("service_id"),
            subject_id: row.get("subject_id"),
            instance: row.get::<i64, _>("instance") as u64,
        },
        uid: row.get::<i64, _>("uid") as u32,
        priority: row.get::<i64, _>("priority") as u64,
        storage_path: row.get("storage_path"),
        state_path: row.get("state_path"),
        network_parameters: serde_json::from_str(&row.get::<String, _>("network_parameters"))?,
        run_state: RunState::from(row.get::<String, _>("run_state").as_str()),
        exit_code: row.get("exit_code"),
        service_version: row.get("service_version"),
    })
}

fn row_to_lease(row: SqliteRow) -> Result<NetworkLease> {
    Ok(NetworkLease {
        network_id: row.get("network_id"),
        instance_id: row.get("instance_id"),
        ip: row.get("ip"),
        vlan_id: row.get::<i64, _>("vlan_id") as u64,
        parameters: serde_json::from_str(&row.get::<String, _>("parameters"))?,
    })
}

fn timestamp_from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
