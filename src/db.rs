//! Connection lifecycle for the PostgreSQL backend.
//!
//! A [`Db`] owns a [`Config`] and at most one open pool. Opening an open
//! handle or closing a closed one only logs a warning. Store access on a
//! closed handle fails with [`ArchiveError::ConnectionClosed`].

use std::future::Future;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ArchiveError, Result};
use crate::store::PgStore;

#[derive(Debug)]
pub struct Db {
    config: Config,
    pool: Option<PgPool>,
}

impl Db {
    /// A closed handle; call [`Db::open`] before use.
    pub fn new(config: Config) -> Self {
        Self { config, pool: None }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.pool.is_some()
    }

    /// Connect the pool. No-op with a warning when already open.
    pub async fn open(&mut self) -> Result<()> {
        // ---
        if self.pool.is_some() {
            warn!("Database session already open");
            return Ok(());
        }

        info!("Attempting to connect to database: {}", self.config.masked_db_url());
        let pool = PgPoolOptions::new()
            .max_connections(self.config.db_pool_max)
            .connect(&self.config.db_url)
            .await?;
        info!("Successfully connected to database");

        self.pool = Some(pool);
        Ok(())
    }

    /// Close the pool. No-op with a warning when already closed.
    pub async fn close(&mut self) {
        // ---
        match self.pool.take() {
            Some(pool) => {
                pool.close().await;
                info!("Database session closed");
            }
            None => warn!("Database session already closed"),
        }
    }

    pub fn pool(&self) -> Result<&PgPool> {
        self.pool.as_ref().ok_or(ArchiveError::ConnectionClosed)
    }

    /// Store bound to the open pool and the configured partition router.
    pub fn store(&self) -> Result<PgStore> {
        // ---
        let pool = self.pool()?.clone();
        Ok(PgStore::new(pool, self.config.router()))
    }

    /// Run `f` against an open store.
    ///
    /// Opens the handle when it is closed and closes it again afterwards,
    /// whether `f` succeeded or not. A handle that was already open stays
    /// open.
    pub async fn scope<F, Fut, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(PgStore) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // ---
        let opened_here = !self.is_open();
        if opened_here {
            self.open().await?;
        }

        let result = match self.store() {
            Ok(store) => f(store).await,
            Err(e) => Err(e),
        };

        if opened_here {
            self.close().await;
        }
        result
    }
}
