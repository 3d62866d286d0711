//! Command gateway
//!
//! Entry point for every member command: the session is verified before the
//! sequence controller is touched, and the changed actuator field is written
//! back to the store after the motion completes. A failing write after the
//! motion is logged and reported, never turned into a failed command, since
//! the hardware has already moved.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::auth::{AuthError, SessionAuthority};
use crate::device::{DeviceState, DismantlePosition, DoorPosition, LockPosition};
use crate::sequence::{Command, SequenceController, SequenceError};
use crate::store::{DeviceRecord, DeviceStore, MemberProfile, StoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Member is not logged in")]
    SessionInactive,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error("Unknown member: {0}")]
    MemberNotFound(String),

    #[error("No device registered for member {0}")]
    DeviceNotFound(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a failure should be reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    NotFound,
    Unavailable,
    Internal,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::MissingField(_) => ErrorKind::BadRequest,
            GatewayError::SessionInactive => ErrorKind::Unauthorized,
            GatewayError::Auth(e) => match e {
                AuthError::TokenMalformed(_) => ErrorKind::BadRequest,
                AuthError::AuthorityUnavailable | AuthError::ProviderUnavailable(_) => {
                    ErrorKind::Unavailable
                }
                AuthError::SubjectNotFound(_) => ErrorKind::NotFound,
            },
            GatewayError::Sequence(e) => match e {
                SequenceError::InvalidTarget { .. } => ErrorKind::BadRequest,
                _ => ErrorKind::Internal,
            },
            GatewayError::MemberNotFound(_) | GatewayError::DeviceNotFound(_) => {
                ErrorKind::NotFound
            }
            GatewayError::Store(_) => ErrorKind::Unavailable,
        }
    }
}

/// Result of an accepted command
#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    /// Device snapshot after the command
    pub settings: DeviceState,
    /// False when the actuator was already at the target
    pub moved: bool,
    /// False when the store write after the motion failed
    pub persisted: bool,
}

/// Device row plus the connection check
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub settings: DeviceRecord,
    /// Last commanded positions held by this process
    pub state: Option<DeviceState>,
}

pub struct CommandGateway {
    authority: Arc<SessionAuthority>,
    store: Arc<dyn DeviceStore>,
    controller: SequenceController,
    app_secret: String,
}

impl CommandGateway {
    pub fn new(
        authority: Arc<SessionAuthority>,
        store: Arc<dyn DeviceStore>,
        controller: SequenceController,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            authority,
            store,
            controller,
            app_secret: app_secret.into(),
        }
    }

    pub fn controller(&self) -> &SequenceController {
        &self.controller
    }

    pub async fn set_lock(&self, token: &str, locked: bool) -> Result<CommandReport, GatewayError> {
        self.execute(token, Command::Lock(LockPosition::from(locked))).await
    }

    pub async fn set_dismantle(
        &self,
        token: &str,
        dismantle: bool,
    ) -> Result<CommandReport, GatewayError> {
        self.execute(token, Command::Dismantle(DismantlePosition::from(dismantle))).await
    }

    pub async fn set_expansion(
        &self,
        token: &str,
        level: i64,
    ) -> Result<CommandReport, GatewayError> {
        self.execute(token, Command::Expansion(level)).await
    }

    pub async fn set_door(
        &self,
        token: &str,
        door: DoorPosition,
    ) -> Result<CommandReport, GatewayError> {
        self.execute(token, Command::Door(door)).await
    }

    /// Load the member's device row and refresh its connection flag
    pub async fn device_status(&self, token: &str) -> Result<DeviceStatus, GatewayError> {
        let member = self.authorize(token).await?;
        let mut device = self.load_device(member.id).await?;
        self.seed_from(&device);

        let connected = !self.app_secret.is_empty()
            && device.user_security_key.as_deref() == Some(self.app_secret.as_str());
        if let Err(e) = self.store.set_connected(member.id, connected).await {
            tracing::error!(member_id = member.id, "failed to record connection status: {}", e);
        }
        device.connected = connected;

        Ok(DeviceStatus {
            connected,
            settings: device,
            state: self.controller.snapshot(),
        })
    }

    async fn execute(&self, token: &str, command: Command) -> Result<CommandReport, GatewayError> {
        let member = self.authorize(token).await?;
        self.ensure_seeded(member.id).await?;

        let outcome = self.controller.apply(command).await.inspect_err(|e| {
            tracing::warn!(
                member_id = member.id,
                actuator = command.actuator(),
                "command rejected: {}",
                e
            );
        })?;

        let mut persisted = true;
        if let Some(update) = outcome.update {
            if let Err(e) = self.store.record_actuator(member.id, update).await {
                tracing::error!(
                    member_id = member.id,
                    actuator = command.actuator(),
                    "actuation completed but was not persisted: {}",
                    e
                );
                persisted = false;
            }
        }

        Ok(CommandReport {
            moved: outcome.moved(),
            settings: outcome.state,
            persisted,
        })
    }

    /// Verify the session and resolve the requesting member
    async fn authorize(&self, token: &str) -> Result<MemberProfile, GatewayError> {
        if token.trim().is_empty() {
            return Err(GatewayError::MissingField("access_token"));
        }

        let check = self.authority.verify(token).await.inspect_err(|e| {
            tracing::warn!("session check failed: {}", e);
        })?;
        if !check.active {
            tracing::warn!(subject = %check.claims.sub, "no active session for member token");
            return Err(GatewayError::SessionInactive);
        }

        let username = check
            .claims
            .preferred_username
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AuthError::TokenMalformed("token carries no username".to_string()))?;

        self.store
            .member(&username)
            .await?
            .ok_or(GatewayError::MemberNotFound(username))
    }

    async fn load_device(&self, member_id: i32) -> Result<DeviceRecord, GatewayError> {
        self.store
            .device(member_id)
            .await?
            .ok_or(GatewayError::DeviceNotFound(member_id))
    }

    async fn ensure_seeded(&self, member_id: i32) -> Result<(), GatewayError> {
        if self.controller.is_seeded() {
            return Ok(());
        }
        let device = self.load_device(member_id).await?;
        self.seed_from(&device);
        Ok(())
    }

    fn seed_from(&self, device: &DeviceRecord) {
        let max_level = self.controller.timing().max_level;
        self.controller.seed(device.state(max_level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Hardware, Journal};
    use crate::config::Calibration;
    use crate::keycloak::ProviderError;
    use crate::store::MemoryStore;
    use crate::testing::{member_token, ScriptedProvider};

    struct Bench {
        gateway: CommandGateway,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
        journal: Journal,
    }

    fn record(door_open: bool, expanding_value: i32) -> DeviceRecord {
        DeviceRecord {
            id: 1,
            security_key: Some("box-key".to_string()),
            user_security_key: Some("app-secret".to_string()),
            host: None,
            member_id: 7,
            connected: false,
            locked: false,
            dismantle: false,
            expanding_value,
            door_open,
        }
    }

    async fn bench(device: DeviceRecord) -> Bench {
        let provider = Arc::new(ScriptedProvider::new());
        let authority = Arc::new(SessionAuthority::connect(provider.clone()).await.unwrap());

        let store = Arc::new(MemoryStore::new());
        store.insert_member(MemberProfile {
            id: 7,
            username: "ana".to_string(),
            email: None,
            first_name: None,
            last_name: None,
        });
        store.insert_device(device);

        let journal = Journal::new();
        let controller =
            SequenceController::new(Hardware::simulated(&journal, false), &Calibration::default())
                .unwrap();

        Bench {
            gateway: CommandGateway::new(authority, store.clone(), controller, "app-secret"),
            provider,
            store,
            journal,
        }
    }

    fn ana() -> String {
        member_token("sub-1", "ana")
    }

    #[tokio::test]
    async fn test_lock_command_moves_and_persists() {
        let b = bench(record(false, 0)).await;

        let report = b.gateway.set_lock(&ana(), true).await.unwrap();
        assert!(report.moved);
        assert!(report.persisted);
        assert!(report.settings.lock.is_locked());
        assert!(b.store.device(7).await.unwrap().unwrap().locked);
    }

    #[tokio::test]
    async fn test_door_open_when_already_open_is_noop() {
        let b = bench(record(true, 0)).await;

        let report = b.gateway.set_door(&ana(), DoorPosition::Open).await.unwrap();
        assert!(!report.moved);
        assert!(report.settings.door.is_open());
        assert!(b.journal.events().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_session_never_moves() {
        let b = bench(record(false, 0)).await;
        b.provider.push_sessions(Ok(0));

        let err = b.gateway.set_door(&ana(), DoorPosition::Open).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(b.journal.events().is_empty());
        assert!(!b.gateway.controller().is_seeded());
    }

    #[tokio::test]
    async fn test_error_classification() {
        let b = bench(record(false, 0)).await;

        let err = b.gateway.set_lock("", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = b.gateway.set_lock("not-a-jwt", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        b.provider.push_sessions(Err(ProviderError::ServerError {
            status: 503,
            context: "sessions".into(),
        }));
        let err = b.gateway.set_lock(&ana(), true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        let err = b.gateway.set_expansion(&ana(), 9).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let err = b
            .gateway
            .set_lock(&member_token("sub-2", "bob"), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(b.journal.events().is_empty());
    }

    #[tokio::test]
    async fn test_expansion_seeds_from_store() {
        let b = bench(record(false, 3)).await;

        let report = b.gateway.set_expansion(&ana(), 5).await.unwrap();
        assert_eq!(report.settings.expansion, 5);
        assert!(report.settings.fully_extended());
        assert_eq!(b.store.device(7).await.unwrap().unwrap().expanding_value, 5);
    }

    #[tokio::test]
    async fn test_failed_write_still_reports_motion() {
        let b = bench(record(false, 0)).await;
        b.store.fail_writes(true);

        let report = b.gateway.set_dismantle(&ana(), true).await.unwrap();
        assert!(report.moved);
        assert!(!report.persisted);
        assert!(report.settings.dismantle.is_engaged());
        assert!(b.gateway.controller().snapshot().unwrap().dismantle.is_engaged());
    }

    #[tokio::test]
    async fn test_device_status_connection_check() {
        let b = bench(record(false, 2)).await;

        let status = b.gateway.device_status(&ana()).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.state.unwrap().expansion, 2);
        assert!(b.store.device(7).await.unwrap().unwrap().connected);

        let mut unpaired = record(false, 2);
        unpaired.user_security_key = Some("other".to_string());
        let b = bench(unpaired).await;
        let status = b.gateway.device_status(&ana()).await.unwrap();
        assert!(!status.connected);
        assert!(!status.settings.connected);
    }
}
