//! Relay server composition root
//!
//! Owns the three per-protocol registries, the shared outbound HTTP
//! client, and the axum surface. Streams are declared explicitly against
//! the server handle; nothing is registered behind the caller's back.

pub mod config;
pub mod http;

pub use config::RelayConfig;
pub use http::{router, AppState};

use std::sync::Arc;

use crate::error::Result;
use crate::relay::{HlsBroker, PulledFlvBroker};

/// The relay server.
///
/// ```no_run
/// use relay_rs::server::{RelayConfig, RelayServer};
///
/// # async fn example() -> relay_rs::error::Result<()> {
/// let server = RelayServer::new(RelayConfig::default());
/// server.add_flv_stream("room1", "http://upstream.example/live/room1.flv");
/// server.add_hls_stream("room2", "http://upstream.example/live/room2.m3u8", None)?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct RelayServer {
    state: AppState,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: AppState::new(config),
        }
    }

    /// Shared state, for embedding the router elsewhere.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Declare a pulled-FLV stream: starts its ingest loop immediately and
    /// registers it under `key`. An existing broker under the same key is
    /// closed and replaced.
    pub fn add_flv_stream(&self, key: impl Into<String>, upstream_url: impl Into<String>) {
        let key = key.into();

        // When ingest definitively ends (retry budget exhausted), the
        // broker retires itself from the registry.
        let registry = Arc::clone(&self.state.flv);
        let registry_key = key.clone();
        let on_terminate: Box<dyn FnOnce() + Send> = Box::new(move || {
            // The terminating broker closed itself first; leave a live
            // replacement registered under the same key alone
            let retired = registry
                .find(&registry_key)
                .map(|current| current.is_closed())
                .unwrap_or(false);
            if retired {
                registry.remove(&registry_key);
            }
        });

        let broker = PulledFlvBroker::spawn(
            key.clone(),
            upstream_url,
            self.state.http.clone(),
            self.state.config.pulled.clone(),
            Some(on_terminate),
        );

        if let Some(old) = self.state.flv.add(key, broker) {
            old.close();
        }
    }

    /// Declare an HLS stream mirror. `variant_preference` overrides the
    /// configured default for this stream.
    pub fn add_hls_stream(
        &self,
        key: impl Into<String>,
        upstream_url: &str,
        variant_preference: Option<String>,
    ) -> Result<()> {
        let key = key.into();
        let url = url::Url::parse(upstream_url)?;

        let mut config = self.state.config.hls.clone();
        if variant_preference.is_some() {
            config.variant_preference = variant_preference;
        }

        let broker = HlsBroker::spawn(key.clone(), url, self.state.http.clone(), config);
        if let Some(old) = self.state.hls.add(key, broker) {
            old.close();
        }
        Ok(())
    }

    /// Remove a pulled-FLV stream, shutting its broker down.
    pub fn remove_flv_stream(&self, key: &str) -> bool {
        match self.state.flv.remove(key) {
            Some(broker) => {
                broker.close();
                true
            }
            None => false,
        }
    }

    /// Remove an HLS stream, shutting its broker down.
    pub fn remove_hls_stream(&self, key: &str) -> bool {
        match self.state.hls.remove(key) {
            Some(broker) => {
                broker.close();
                true
            }
            None => false,
        }
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.bind_addr;
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "relay server listening");
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Bind and serve with graceful shutdown.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.state.config.bind_addr;
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "relay server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_declare_and_remove_streams() {
        let server = RelayServer::new(RelayConfig::default());

        server.add_flv_stream("room1", "http://127.0.0.1:9/live.flv");
        assert!(server.state().flv.contains("room1"));

        server
            .add_hls_stream("room2", "http://127.0.0.1:9/live.m3u8", None)
            .unwrap();
        assert!(server.state().hls.contains("room2"));

        assert!(server.remove_flv_stream("room1"));
        assert!(!server.remove_flv_stream("room1"));
        assert!(server.remove_hls_stream("room2"));
        assert!(!server.state().hls.contains("room2"));
    }

    #[tokio::test]
    async fn test_redeclare_replaces_broker() {
        let server = RelayServer::new(RelayConfig::default());

        server.add_flv_stream("room1", "http://127.0.0.1:9/a.flv");
        let first = server.state().flv.find("room1").unwrap();

        server.add_flv_stream("room1", "http://127.0.0.1:9/b.flv");
        let second = server.state().flv.find("room1").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert!(!second.is_closed());

        server.remove_flv_stream("room1");
    }

    #[tokio::test]
    async fn test_bad_hls_url_rejected() {
        let server = RelayServer::new(RelayConfig::default());
        assert!(server
            .add_hls_stream("room1", "not a url", None)
            .is_err());
    }
}
