use crate::config::Config;
use crate::db::Db;
use crate::errors::ApiError;
use crate::fhe::{LocalGateway, LocalKms};
use crate::ledger::LocalLedger;
use club_core::engine::LocalFheEngine;
use club_core::types::{ContractAddress, MemberAddress};
use club_core::{Collaborators, ControllerConfig, InvestmentController};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    services: Collaborators,
    /// One controller per member; members never share in-flight locks or status.
    sessions: Arc<RwLock<HashMap<MemberAddress, InvestmentController>>>,
    viewer: InvestmentController,
}

impl AppState {
    pub async fn new(config: Config, db: Db) -> Result<Self, ApiError> {
        let seed = ensure_engine_seed(&config.data_dir).await?;
        let engine = Arc::new(LocalFheEngine::from_seed(seed));
        let contract = ContractAddress::new(config.contract_address.clone());

        let services = Collaborators {
            gateway: Arc::new(LocalGateway::new(engine.clone())),
            ledger: Arc::new(LocalLedger::new(db.clone(), engine.clone(), contract)),
            verifier: Arc::new(LocalKms::new(db, engine)),
        };

        let viewer = InvestmentController::new(services.clone(), controller_config(&config, None));

        Ok(Self {
            config: Arc::new(config),
            services,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            viewer,
        })
    }

    /// Read-only controller with no member attached.
    pub fn viewer(&self) -> &InvestmentController {
        &self.viewer
    }

    /// The controller acting for `member`, created on first use.
    ///
    /// At capacity, sessions with nothing on their status board are evicted first; if every
    /// session is busy the request is turned away.
    pub async fn session_for(&self, member: &MemberAddress) -> Result<InvestmentController, ApiError> {
        if let Some(controller) = self.sessions.read().await.get(member) {
            return Ok(controller.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(controller) = sessions.get(member) {
            return Ok(controller.clone());
        }

        if sessions.len() >= self.config.max_sessions {
            let before = sessions.len();
            sessions.retain(|_, session| session.current_status().is_visible());
            debug!(evicted = before - sessions.len(), "evicted idle member sessions");

            if sessions.len() >= self.config.max_sessions {
                warn!(%member, limit = self.config.max_sessions, "member session limit reached");
                return Err(ApiError::Busy("too many active member sessions".to_string()));
            }
        }

        info!(%member, "opening member session");
        let controller = InvestmentController::new(
            self.services.clone(),
            controller_config(&self.config, Some(member.clone())),
        );
        sessions.insert(member.clone(), controller.clone());
        Ok(controller)
    }

    /// Existing session for `member`, without opening one.
    pub async fn existing_session(&self, member: &MemberAddress) -> Option<InvestmentController> {
        self.sessions.read().await.get(member).cloned()
    }
}

fn controller_config(config: &Config, member: Option<MemberAddress>) -> ControllerConfig {
    let mut controller = ControllerConfig::new(ContractAddress::new(config.contract_address.clone()));
    if let Some(member) = member {
        controller = controller.with_submitter(member);
    }
    if let Some(timeout) = config.call_timeout {
        controller = controller.with_call_timeout(timeout);
    }
    controller
}

/// Load the engine key seed from `data_dir/keys`, generating it on first start.
async fn ensure_engine_seed(data_dir: &Path) -> Result<[u8; 32], ApiError> {
    let data_dir = data_dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let keys_dir = data_dir.join("keys");
        std::fs::create_dir_all(&keys_dir).map_err(|_| ApiError::Internal)?;

        let seed_path = keys_dir.join("engine.seed");

        if seed_path.exists() {
            let text = std::fs::read_to_string(&seed_path).map_err(|_| ApiError::Internal)?;
            let bytes = hex::decode(text.trim())
                .map_err(|_| ApiError::Config(format!("{} is not valid hex", seed_path.display())))?;
            return <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| ApiError::Config(format!("{} must hold 32 bytes", seed_path.display())));
        }

        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        std::fs::write(&seed_path, hex::encode(seed)).map_err(|_| ApiError::Internal)?;
        info!(path = %seed_path.display(), "generated engine key seed");

        Ok(seed)
    })
    .await
    .map_err(|_| ApiError::Internal)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn state_with(dir: &tempfile::TempDir, max_sessions: usize) -> AppState {
        let database_url = format!("sqlite:{}", dir.path().join("ledger.sqlite").to_string_lossy());
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            database_url: database_url.clone(),
            db_max_connections: 2,
            api_key: "test-key".to_string(),
            contract_address: "0x00000000000000000000000000000000000c1ab0".to_string(),
            call_timeout: None,
            max_sessions,
        };
        let db = db::connect(&database_url, 2).await.unwrap();
        db::init_schema(&db).await.unwrap();
        AppState::new(config, db).await.unwrap()
    }

    #[tokio::test]
    async fn sessions_are_reused_per_member() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 4).await;
        let alice = MemberAddress::from("0xalice");

        let first = state.session_for(&alice).await.unwrap();
        first.check_available().await.unwrap();
        let second = state.session_for(&alice).await.unwrap();
        assert_eq!(second.current_status(), first.current_status());
    }

    #[tokio::test]
    async fn idle_sessions_make_room_for_new_members() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;
        let alice = MemberAddress::from("0xalice");
        let bob = MemberAddress::from("0xbob");

        state.session_for(&alice).await.unwrap();
        state.session_for(&bob).await.unwrap();

        assert!(state.existing_session(&alice).await.is_none());
        assert!(state.existing_session(&bob).await.is_some());
    }

    #[tokio::test]
    async fn busy_sessions_are_kept_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with(&dir, 1).await;
        let alice = MemberAddress::from("0xalice");

        // A fresh status stays on the board for a couple of seconds.
        state.session_for(&alice).await.unwrap().check_available().await.unwrap();

        let refused = state.session_for(&MemberAddress::from("0xbob")).await;
        assert!(matches!(refused, Err(ApiError::Busy(_))));
        assert!(state.existing_session(&alice).await.is_some());
    }

    #[tokio::test]
    async fn engine_seed_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let first = ensure_engine_seed(dir.path()).await.unwrap();
        let second = ensure_engine_seed(dir.path()).await.unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join("keys").join("engine.seed").exists());
    }

    #[tokio::test]
    async fn corrupt_seed_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("keys")).unwrap();
        std::fs::write(dir.path().join("keys").join("engine.seed"), "abcd").unwrap();

        assert!(matches!(ensure_engine_seed(dir.path()).await, Err(ApiError::Config(_))));
    }
}
