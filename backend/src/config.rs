use std::sync::Arc;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};

use crate::secret_store::{PlaintextSecretStore, SecretStore};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Fallback matching the original implementation's `DEFAULT_SQLITE_URL`
/// (see SPEC_FULL.md's config section) — a zero-config embedded file next
/// to the working directory. Diesel's sqlite backend takes a plain file
/// path rather than a `sqlite://` URL, unlike the SQLAlchemy original.
const DEFAULT_DATABASE_URL: &str = "./opsnav.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub debug: bool,
    pub db_pool_size: u32,
    pub app_host: String,
    pub app_port: u16,
    pub cors_origins: Vec<String>,
    pub esxi_user: Option<String>,
    pub esxi_password: Option<String>,
    pub secret_key: String,
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let debug = std::env::var("DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let db_pool_size = std::env::var("DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let app_host = std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let app_port = std::env::var("APP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        let cors_origins = std::env::var("CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let esxi_user = std::env::var("ESXI_USER").ok();
        let esxi_password = std::env::var("ESXI_PASSWORD").ok();
        let secret_key = std::env::var("SECRET_KEY")
            .unwrap_or_else(|_| "dev-insecure-secret-key-change-me".to_string());
        if secret_key.len() < 16 {
            eyre::bail!("SECRET_KEY must be at least 16 characters");
        }

        Ok(Config {
            database_url,
            debug,
            db_pool_size,
            app_host,
            app_port,
            cors_origins,
            esxi_user,
            esxi_password,
            secret_key,
        })
    }

    /// Credential resolution order used by virtualization operations:
    /// an explicit per-call credential always wins, then a stored host
    /// credential, then these environment defaults (original_source
    /// behavior, see SPEC_FULL.md).
    pub fn default_credentials(&self) -> Option<(String, String)> {
        match (&self.esxi_user, &self.esxi_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

pub struct InnerState {
    pub config: Config,
    pub pool: DbPool,
    pub secrets: Box<dyn SecretStore>,
}

#[derive(Clone)]
pub struct AppState(pub Arc<InnerState>);

impl AppState {
    pub fn new(config: Config, pool: DbPool) -> Self {
        AppState(Arc::new(InnerState {
            config,
            pool,
            secrets: Box::new(PlaintextSecretStore),
        }))
    }

    pub fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<ConnectionManager<SqliteConnection>>,
        diesel::r2d2::PoolError,
    > {
        self.0.pool.get()
    }
}

impl std::ops::Deref for AppState {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn build_pool(database_url: &str, pool_size: u32) -> eyre::Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder().max_size(pool_size).build(manager)?;
    Ok(pool)
}

pub fn run_migrations(pool: &DbPool) -> eyre::Result<()> {
    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| eyre::eyre!("failed to run migrations: {e}"))?;
    Ok(())
}
