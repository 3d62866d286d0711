//! Device persistence
//!
//! Member profiles and the device row live in the shared member database.
//! Reads distinguish "not found" (`Ok(None)`) from a failing store (`Err`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{FromRow, Postgres};
use thiserror::Error;

use crate::config::StoreConfig;
use crate::device::{ActuatorUpdate, DeviceState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid seed file {path}: {reason}")]
    Seed { path: String, reason: String },
}

/// Member profile joined with its details row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MemberProfile {
    pub id: i32,
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Device row joined with its actuator fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DeviceRecord {
    pub id: i32,
    #[serde(skip_serializing, default)]
    pub security_key: Option<String>,
    #[serde(skip_serializing, default)]
    pub user_security_key: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    pub member_id: i32,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub dismantle: bool,
    #[serde(default)]
    pub expanding_value: i32,
    #[serde(default)]
    pub door_open: bool,
}

impl DeviceRecord {
    /// Seed state for the sequence controller
    pub fn state(&self, max_level: u8) -> DeviceState {
        DeviceState::seeded(
            self.locked,
            self.dismantle,
            self.door_open,
            self.expanding_value,
            max_level,
        )
    }

    fn apply(&mut self, update: ActuatorUpdate) {
        match update {
            ActuatorUpdate::Lock(lock) => self.locked = lock.is_locked(),
            ActuatorUpdate::Dismantle(dismantle) => self.dismantle = dismantle.is_engaged(),
            ActuatorUpdate::Door(door) => self.door_open = door.is_open(),
            ActuatorUpdate::Expansion { level, .. } => self.expanding_value = i32::from(level),
        }
    }
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn member(&self, username: &str) -> Result<Option<MemberProfile>, StoreError>;

    /// Device row owned by `member_id`
    async fn device(&self, member_id: i32) -> Result<Option<DeviceRecord>, StoreError>;

    /// Write the single actuator field a sequence changed
    async fn record_actuator(
        &self,
        member_id: i32,
        update: ActuatorUpdate,
    ) -> Result<(), StoreError>;

    async fn set_connected(&self, member_id: i32, connected: bool) -> Result<(), StoreError>;
}

/// PostgreSQL store over the member database
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgStore {
    async fn member(&self, username: &str) -> Result<Option<MemberProfile>, StoreError> {
        let member = sqlx::query_as::<_, MemberProfile>(
            "SELECT m.id, m.username, m.email, md.first_name, md.last_name
             FROM members m
             INNER JOIN member_details md ON m.id = md.member_id
             WHERE m.username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(member)
    }

    async fn device(&self, member_id: i32) -> Result<Option<DeviceRecord>, StoreError> {
        let device = sqlx::query_as::<_, DeviceRecord>(
            "SELECT rd.id, rd.security_key, rd.user_security_key, rd.host, rd.member_id,
                    rd.connected, bl.locked, bl.dismantle, bl.expanding_value, bl.door_open
             FROM rpi_devices rd
             INNER JOIN box_locking bl ON bl.member_id = rd.member_id
             WHERE rd.member_id = $1",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn record_actuator(
        &self,
        member_id: i32,
        update: ActuatorUpdate,
    ) -> Result<(), StoreError> {
        let query: Query<'_, Postgres, PgArguments> = match update {
            ActuatorUpdate::Lock(lock) => {
                sqlx::query("UPDATE box_locking SET locked = $1 WHERE member_id = $2")
                    .bind(lock.is_locked())
            }
            ActuatorUpdate::Dismantle(dismantle) => {
                sqlx::query("UPDATE box_locking SET dismantle = $1 WHERE member_id = $2")
                    .bind(dismantle.is_engaged())
            }
            ActuatorUpdate::Door(door) => {
                sqlx::query("UPDATE box_locking SET door_open = $1 WHERE member_id = $2")
                    .bind(door.is_open())
            }
            ActuatorUpdate::Expansion { level, .. } => {
                sqlx::query("UPDATE box_locking SET expanding_value = $1 WHERE member_id = $2")
                    .bind(i32::from(level))
            }
        };

        let result = query.bind(member_id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            tracing::warn!(member_id, "no box_locking row to update");
        }
        Ok(())
    }

    async fn set_connected(&self, member_id: i32, connected: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE rpi_devices SET connected = $1 WHERE member_id = $2")
            .bind(connected)
            .bind(member_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Rows loaded into a `MemoryStore` at startup
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub members: Vec<MemberProfile>,
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

#[derive(Default)]
struct Tables {
    members: HashMap<String, MemberProfile>,
    devices: HashMap<i32, DeviceRecord>,
    fail_writes: bool,
}

/// Store kept in process memory, for bench runs without a database
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        let store = Self::new();
        for member in seed.members {
            store.insert_member(member);
        }
        for device in seed.devices {
            store.insert_device(device);
        }
        store
    }

    /// Build a store from a TOML file of `[[members]]` and `[[devices]]`
    pub fn from_seed_file(path: &Path) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::Seed {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let seed: StoreSeed = toml::from_str(&content).map_err(|e| invalid(e.to_string()))?;

        tracing::info!(
            members = seed.members.len(),
            devices = seed.devices.len(),
            "loaded in-memory store seed"
        );
        Ok(Self::from_seed(seed))
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_member(&self, member: MemberProfile) {
        self.tables().members.insert(member.username.clone(), member);
    }

    pub fn insert_device(&self, device: DeviceRecord) {
        self.tables().devices.insert(device.member_id, device);
    }

    /// Make every following write fail until switched off again
    pub fn fail_writes(&self, fail: bool) {
        self.tables().fail_writes = fail;
    }

    fn writable(tables: &Tables) -> Result<(), StoreError> {
        if tables.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn member(&self, username: &str) -> Result<Option<MemberProfile>, StoreError> {
        Ok(self.tables().members.get(username).cloned())
    }

    async fn device(&self, member_id: i32) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.tables().devices.get(&member_id).cloned())
    }

    async fn record_actuator(
        &self,
        member_id: i32,
        update: ActuatorUpdate,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables();
        Self::writable(&tables)?;
        match tables.devices.get_mut(&member_id) {
            Some(device) => device.apply(update),
            None => tracing::warn!(member_id, "no device row to update"),
        }
        Ok(())
    }

    async fn set_connected(&self, member_id: i32, connected: bool) -> Result<(), StoreError> {
        let mut tables = self.tables();
        Self::writable(&tables)?;
        if let Some(device) = tables.devices.get_mut(&member_id) {
            device.connected = connected;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DoorPosition, LockPosition, Travel};

    fn device(member_id: i32) -> DeviceRecord {
        DeviceRecord {
            id: 1,
            security_key: Some("box-key".to_string()),
            user_security_key: Some("app-secret".to_string()),
            host: Some("10.0.0.12".to_string()),
            member_id,
            connected: false,
            locked: false,
            dismantle: false,
            expanding_value: 3,
            door_open: false,
        }
    }

    #[test]
    fn test_record_seeds_state() {
        let state = device(7).state(5);
        assert_eq!(state.expansion, 3);
        assert_eq!(state.lock, LockPosition::Unlocked);
        assert!(!state.door.is_open());
        assert_eq!(state.last_known_expansion, None);
    }

    #[test]
    fn test_security_keys_not_serialized() {
        let json = serde_json::to_value(device(7)).unwrap();
        assert!(json.get("security_key").is_none());
        assert!(json.get("user_security_key").is_none());
        assert_eq!(json["expanding_value"], 3);
    }

    #[tokio::test]
    async fn test_memory_store_records_updates() {
        let store = MemoryStore::new();
        store.insert_device(device(7));

        store.record_actuator(7, ActuatorUpdate::Door(DoorPosition::Open)).await.unwrap();
        store
            .record_actuator(7, ActuatorUpdate::Expansion { level: 5, travel: Travel::Extended })
            .await
            .unwrap();
        store.set_connected(7, true).await.unwrap();

        let row = store.device(7).await.unwrap().unwrap();
        assert!(row.door_open);
        assert_eq!(row.expanding_value, 5);
        assert!(row.connected);
        assert!(!row.locked);
    }

    #[tokio::test]
    async fn test_missing_rows_are_none() {
        let store = MemoryStore::new();
        assert!(store.member("ana").await.unwrap().is_none());
        assert!(store.device(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_seed_file_fills_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(
            &path,
            r#"
            [[members]]
            id = 7
            username = "ana"

            [[devices]]
            id = 1
            member_id = 7
            user_security_key = "app-secret"
            expanding_value = 2
            "#,
        )
        .unwrap();

        let store = MemoryStore::from_seed_file(&path).unwrap();
        assert_eq!(store.member("ana").await.unwrap().unwrap().id, 7);

        let row = store.device(7).await.unwrap().unwrap();
        assert_eq!(row.user_security_key.as_deref(), Some("app-secret"));
        assert_eq!(row.expanding_value, 2);
        assert!(!row.door_open);
    }

    #[test]
    fn test_bad_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = MemoryStore::from_seed_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(StoreError::Seed { .. })));

        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "[[devices]]\nid = 1\n").unwrap();
        assert!(matches!(MemoryStore::from_seed_file(&path), Err(StoreError::Seed { .. })));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryStore::new();
        store.insert_device(device(7));
        store.fail_writes(true);

        let result = store.record_actuator(7, ActuatorUpdate::Lock(LockPosition::Locked)).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(!store.device(7).await.unwrap().unwrap().locked);
    }
}
