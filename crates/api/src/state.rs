use std::path::Path;
use std::sync::Arc;

use campus_domain::membership::MembershipService;
use campus_domain::ports::membership::ToggleStore;
use campus_domain::ports::subjects::SubjectStore;
use campus_domain::subjects::SubjectService;
use campus_infra::config::{AppConfig, DataBackend};
use campus_infra::db::DbConfig;
use campus_infra::repositories::{InMemoryToggleStore, SqliteToggleStore, SurrealToggleStore};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub memberships: MembershipService,
    pub subjects: SubjectService,
    pub store: Arc<dyn ToggleStore>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let backend = config.backend()?;
        let state = match backend {
            DataBackend::Memory => Self::with_store(config, InMemoryToggleStore::new()),
            DataBackend::Sqlite => {
                let store = SqliteToggleStore::open(Path::new(&config.sqlite_path))
                    .map_err(|err| anyhow::anyhow!("failed to open sqlite store: {err}"))?;
                Self::with_store(config, store)
            }
            DataBackend::Surreal => {
                let store = SurrealToggleStore::new(&DbConfig::from_app_config(&config)).await?;
                Self::with_store(config, store)
            }
        };
        tracing::info!(backend = state.store.name(), "membership store ready");
        Ok(state)
    }

    pub fn with_store<S>(config: AppConfig, store: S) -> Self
    where
        S: ToggleStore + 'static,
    {
        let store = Arc::new(store);
        let subjects = SubjectService::new(store.clone() as Arc<dyn SubjectStore>);
        let store: Arc<dyn ToggleStore> = store;
        Self {
            config,
            memberships: MembershipService::new(store.clone()),
            subjects,
            store,
        }
    }
}
