//! Connection lifecycle for a single worker.

use switchy_database::{Database, DatabaseTransaction};
use switchy_database_connection::Credentials;

use crate::DbError;

/// Owns one database connection and re-establishes it on demand.
///
/// Each worker holds its own gateway; connections are never shared between
/// workers. [`DbGateway::reconnect`] performs a single connection attempt —
/// the caller decides how often to retry and how long to wait in between.
pub struct DbGateway {
    connection_string: String,
    db: Option<Box<dyn Database>>,
}

impl DbGateway {
    /// Creates a gateway for the given connection URL. No connection is
    /// opened until [`DbGateway::reconnect`] is called.
    #[must_use]
    pub const fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            db: None,
        }
    }

    /// Ensures a healthy connection is held.
    ///
    /// Returns `true` iff a connection is held afterwards. A held connection
    /// that still answers a ping makes this a no-op; a dead one is dropped
    /// and replaced. On failure the caller retries.
    pub async fn reconnect(&mut self) -> bool {
        if let Some(db) = &self.db {
            if ping(db.as_ref()).await {
                return true;
            }
            log::warn!("Database connection is no longer usable, reconnecting");
            self.db = None;
        }

        match connect(&self.connection_string).await {
            Ok(db) => {
                log::info!("Database connection established");
                self.db = Some(db);
                true
            }
            Err(e) => {
                log::error!("{e}");
                false
            }
        }
    }

    /// Begins a transaction on the current connection.
    ///
    /// Returns `None` when no connection is held or the connection refuses
    /// to start a transaction — the connection is dropped in that case so
    /// the next [`DbGateway::reconnect`] starts fresh.
    pub async fn begin_transaction(&mut self) -> Option<Box<dyn DatabaseTransaction>> {
        let db = self.db.as_ref()?;
        match db.begin_transaction().await {
            Ok(tx) => Some(tx),
            Err(e) => {
                log::error!("Could not start a database transaction: {e}");
                self.db = None;
                None
            }
        }
    }
}

async fn connect(connection_string: &str) -> Result<Box<dyn Database>, DbError> {
    let creds =
        Credentials::from_url(connection_string).map_err(|e| DbError::Connect(e.to_string()))?;

    switchy_database_connection::init_postgres_raw_native_tls(creds)
        .await
        .map_err(|e| DbError::Connect(e.to_string()))
}

async fn ping(db: &dyn Database) -> bool {
    db.query_raw_params("SELECT 1", &[]).await.is_ok()
}
