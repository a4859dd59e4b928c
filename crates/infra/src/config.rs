use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBackend {
    Memory,
    Sqlite,
    Surreal,
}

impl DataBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(DataBackend::Memory),
            "sqlite" => Some(DataBackend::Sqlite),
            "surreal" | "surrealdb" => Some(DataBackend::Surreal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
    pub data_backend: String,
    pub sqlite_path: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub request_timeout_ms: u64,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst: u32,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("log_format", "compact")?
            .set_default("data_backend", "memory")?
            .set_default("sqlite_path", "campus_connect.db")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "campus")?
            .set_default("surreal_db", "connect")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("request_timeout_ms", 30_000)?
            .set_default("rate_limit_per_second", 100)?
            .set_default("rate_limit_burst", 200)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        let loaded: Self = cfg.try_deserialize()?;
        loaded.backend()?;
        Ok(loaded)
    }

    pub fn backend(&self) -> Result<DataBackend, config::ConfigError> {
        DataBackend::parse(&self.data_backend).ok_or_else(|| {
            config::ConfigError::Message(format!(
                "unknown data_backend '{}'; expected memory, sqlite or surreal",
                self.data_backend
            ))
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn is_test(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("test")
    }
}
