use anyhow::Context;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }

    /// `host:port` as the websocket engine expects it.
    pub fn ws_address(&self) -> &str {
        let endpoint = self.endpoint.trim();
        endpoint
            .strip_prefix("ws://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .unwrap_or(endpoint)
            .trim_end_matches('/')
    }
}

pub async fn connect_surreal(db_config: &DbConfig) -> anyhow::Result<Surreal<Client>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(db_config.ws_address())
        .await
        .with_context(|| format!("connect to surreal at {}", db_config.endpoint))?;
    db.signin(Root {
        username: &db_config.username,
        password: &db_config.password,
    })
    .await
    .context("surreal signin")?;
    db.use_ns(db_config.namespace.as_str())
        .use_db(db_config.database.as_str())
        .await?;
    tracing::info!(
        endpoint = %db_config.endpoint,
        namespace = %db_config.namespace,
        database = %db_config.database,
        "connected to surreal"
    );
    Ok(db)
}
