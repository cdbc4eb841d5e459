//! Shared application state

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::{Config, PatientDirectoryMode},
    db::{MemoryOccupancyStore, OccupancyStore, PostgresOccupancyStore},
    services::{
        BedRegistry, ConsistencyChecker, EncounterManager, OpenPatientDirectory,
        PatientDirectory, StaticPatientDirectory, StockLedger, WardAggregate,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn OccupancyStore>,
    pub beds: BedRegistry,
    pub wards: WardAggregate,
    pub encounters: EncounterManager,
    pub stock: StockLedger,
    pub consistency: ConsistencyChecker,
}

impl AppState {
    /// Connect the configured backend and wire the services.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn OccupancyStore> = match &config.database.url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.database.pool_max_size)
                    .min_connections(config.database.pool_min_size)
                    .acquire_timeout(Duration::from_secs(config.database.pool_timeout_seconds))
                    .after_connect({
                        let statement_timeout = config.database.statement_timeout_seconds;
                        move |conn, _meta| {
                            Box::pin(async move {
                                sqlx::query(&format!(
                                    "SET statement_timeout = '{statement_timeout}s'"
                                ))
                                .execute(conn)
                                .await?;
                                Ok(())
                            })
                        }
                    })
                    .connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;

                let store = PostgresOccupancyStore::new(pool);
                if config.database.run_migrations {
                    store
                        .migrate()
                        .await
                        .context("Failed to apply database migrations")?;
                }
                tracing::info!("Using PostgreSQL occupancy store");
                Arc::new(store)
            }
            None => {
                tracing::warn!("No database.url configured, using the in-memory occupancy store");
                Arc::new(MemoryOccupancyStore::new())
            }
        };

        let patients: Arc<dyn PatientDirectory> = match config.patients.directory {
            PatientDirectoryMode::Open => Arc::new(OpenPatientDirectory),
            PatientDirectoryMode::Static => Arc::new(StaticPatientDirectory::new(
                config.patients.known.iter().cloned(),
            )),
        };

        Ok(Self::with_store(config, store, patients))
    }

    /// Wire services around an existing store.
    pub fn with_store(
        config: Config,
        store: Arc<dyn OccupancyStore>,
        patients: Arc<dyn PatientDirectory>,
    ) -> Self {
        let locks = config.lock_settings();
        let policy = config.max_policy();

        Self {
            beds: BedRegistry::new(store.clone(), patients.clone(), locks),
            wards: WardAggregate::new(store.clone(), locks),
            encounters: EncounterManager::new(store.clone(), patients, locks),
            stock: StockLedger::new(store.clone(), locks, policy),
            consistency: ConsistencyChecker::new(store.clone(), locks),
            store,
            config: Arc::new(config),
        }
    }
}
