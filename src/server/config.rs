//! Server configuration

use std::net::SocketAddr;

use crate::relay::{HlsConfig, PulledFlvConfig, PushedFlvConfig};

/// Relay server configuration options
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the HTTP surface to
    pub bind_addr: SocketAddr,

    /// Pulled-FLV ingest tunables
    pub pulled: PulledFlvConfig,

    /// Pushed-FLV (camera) ingest tunables
    pub pushed: PushedFlvConfig,

    /// HLS mirror tunables
    pub hls: HlsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            pulled: PulledFlvConfig::default(),
            pushed: PushedFlvConfig::default(),
            hls: HlsConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create a new config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Replace the pulled-FLV tunables
    pub fn pulled(mut self, config: PulledFlvConfig) -> Self {
        self.pulled = config;
        self
    }

    /// Replace the pushed-FLV tunables
    pub fn pushed(mut self, config: PushedFlvConfig) -> Self {
        self.pushed = config;
        self
    }

    /// Replace the HLS tunables
    pub fn hls(mut self, config: HlsConfig) -> Self {
        self.hls = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.pulled.client_queue_capacity, 1024);
        assert_eq!(config.pulled.retry_budget, 10);
        assert_eq!(config.pulled.backoff_base, Duration::from_millis(500));
        assert_eq!(config.pulled.backoff_cap, Duration::from_secs(30));
        assert_eq!(config.pulled.gop_window, Duration::from_secs(5));
        assert_eq!(config.pushed.cache_max_chunks, 150);
        assert_eq!(config.pushed.cache_max_bytes, 4 * 1024 * 1024);
        assert_eq!(config.hls.ring_capacity, 3);
        assert_eq!(config.hls.poll_interval, Duration::from_millis(800));
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let config = RelayConfig::with_addr(addr);
        assert_eq!(config.bind_addr, addr);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let config = RelayConfig::default()
            .bind(addr)
            .pulled(
                PulledFlvConfig::default()
                    .client_queue_capacity(2048)
                    .retry_budget(3),
            )
            .pushed(PushedFlvConfig::default().ingest_grace(Duration::from_secs(5)))
            .hls(HlsConfig::default().ring_capacity(6).variant_preference("720p"));

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.pulled.client_queue_capacity, 2048);
        assert_eq!(config.pulled.retry_budget, 3);
        assert_eq!(config.pushed.ingest_grace, Duration::from_secs(5));
        assert_eq!(config.hls.ring_capacity, 6);
        assert_eq!(config.hls.variant_preference.as_deref(), Some("720p"));
    }
}
