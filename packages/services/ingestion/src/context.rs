use mongodb::{options::ClientOptions, Client as MongoClient, Database};

use crate::config::Config;
use crate::models::*;

/// Process-wide handles, created once in `main` and passed by reference.
pub struct AppContext {
    client: MongoClient,
    db: Database,
}

impl AppContext {
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let mut client_options = ClientOptions::parse(cfg.effective_mongodb_uri()).await?;
        // Honor explicit retryWrites setting from config (double enforcement)
        client_options.retry_writes = Some(cfg.mongodb_retry_writes);
        client_options.app_name = Some("candidate-ingestion".to_string());
        let client = MongoClient::with_options(client_options)?;
        let db = client.database(&cfg.database_name);
        tracing::info!(database = %cfg.database_name, retry_writes = cfg.mongodb_retry_writes, "Connected to MongoDB");
        Ok(Self { client, db })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn shutdown(self) {
        self.client.shutdown().await;
        tracing::debug!("MongoDB client closed");
    }
}
