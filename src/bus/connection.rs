//! Owned broker connection.
//!
//! One `BrokerConnection` per service process. It is opened once at startup,
//! handed to every component that needs a channel, and closed on shutdown.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{BusError, Channel, Connection, ConnectionFactory, Result};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Lazily opened, cached broker connection.
pub struct BrokerConnection {
    factory: Arc<dyn ConnectionFactory>,
    // Held across `open()` so concurrent callers never race to open twice.
    current: Mutex<Option<Arc<dyn Connection>>>,
}

impl BrokerConnection {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// Return the established connection, opening it on first use.
    ///
    /// A connection that dropped after it was opened is reported as a
    /// `Connection` error. There is no reconnection; the process is expected
    /// to exit and be restarted.
    pub async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_open() {
                let endpoint = self.factory.endpoint();
                error!(endpoint = %endpoint, "Broker connection is closed");
                return Err(BusError::Connection(format!(
                    "connection to {} is closed",
                    endpoint
                )));
            }
            return Ok(Arc::clone(conn));
        }

        let endpoint = self.factory.endpoint();
        match self.factory.open().await {
            Ok(conn) => {
                info!(endpoint = %endpoint, "Connected to broker");
                *current = Some(Arc::clone(&conn));
                Ok(conn)
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to connect to broker");
                Err(e)
            }
        }
    }

    /// Open a channel on the established connection.
    ///
    /// Fails with `NotConnected` until `connect()` has succeeded.
    pub async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let conn = self
            .current
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(BusError::NotConnected)?;
        conn.create_channel().await
    }

    pub async fn state(&self) -> ConnectionState {
        match self.current.lock().await.as_ref() {
            Some(conn) if conn.is_open() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Close the connection if one is open.
    pub async fn close(&self) -> Result<()> {
        let taken = self.current.lock().await.take();
        match taken {
            Some(conn) => {
                conn.close().await?;
                info!(endpoint = %self.factory.endpoint(), "Broker connection closed");
                Ok(())
            }
            None => {
                debug!("Close requested without an open broker connection");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.factory.endpoint())
            .finish()
    }
}
