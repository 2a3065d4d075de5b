//! HTTP Client builder module
//!
//! Provides unified HTTP Client building functionality with proxy support

use reqwest::{Client, Proxy};
use std::time::Duration;

use crate::model::config::TlsBackend;

/// Proxy configuration
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy URL, supports http/https/socks5
    pub url: String,
    /// Proxy authentication username
    pub username: Option<String>,
    /// Proxy authentication password
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Create proxy configuration from URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Build HTTP Client
///
/// # Arguments
/// * `proxy` - Optional proxy configuration
/// * `timeout_secs` - Timeout in seconds
///
/// # Returns
/// Configured reqwest::Client
pub fn build_client(
    proxy: Option<&ProxyConfig>,
    timeout_secs: u64,
    tls_backend: TlsBackend,
) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(Duration::from_secs(timeout_secs));

    if tls_backend == TlsBackend::Rustls {
        builder = builder.use_rustls_tls();
    }

    if let Some(proxy_config) = proxy {
        let mut proxy = Proxy::all(&proxy_config.url)?;

        // Set proxy authentication
        if let (Some(username), Some(password)) = (&proxy_config.username, &proxy_config.password) {
            proxy = proxy.basic_auth(username, password);
        }

        builder = builder.proxy(proxy);
        tracing::debug!("HTTP Client using proxy: {}", proxy_config.url);
    }

    Ok(builder.build()?)
}

/// Three pre-configured outbound clients with distinct timeout/pool-size
/// profiles. Each is built lazily on first use and then reused;
/// `warmup` forces eager construction of all three.
pub struct HttpClientPool {
    proxy: Option<ProxyConfig>,
    tls_backend: TlsBackend,
    api: once_cell_lazy::OnceCell<Client>,
    short: once_cell_lazy::OnceCell<Client>,
    model: once_cell_lazy::OnceCell<Client>,
}

/// Tiny re-implementation of a thread-safe lazy cell, avoiding a new
/// dependency: parking_lot already backs the rest of the crate's shared
/// state, so a mutex-guarded `Option` plays the same role `once_cell` would.
mod once_cell_lazy {
    use parking_lot::Mutex;

    pub struct OnceCell<T>(Mutex<Option<T>>);

    impl<T: Clone> OnceCell<T> {
        pub fn new() -> Self {
            Self(Mutex::new(None))
        }

        pub fn get_or_try_init<F>(&self, f: F) -> anyhow::Result<T>
        where
            F: FnOnce() -> anyhow::Result<T>,
        {
            let mut guard = self.0.lock();
            if let Some(value) = guard.as_ref() {
                return Ok(value.clone());
            }
            let value = f()?;
            *guard = Some(value.clone());
            Ok(value)
        }

        pub fn clear(&self) {
            *self.0.lock() = None;
        }
    }
}

impl HttpClientPool {
    pub fn new(proxy: Option<ProxyConfig>, tls_backend: TlsBackend) -> Self {
        Self {
            proxy,
            tls_backend,
            api: once_cell_lazy::OnceCell::new(),
            short: once_cell_lazy::OnceCell::new(),
            model: once_cell_lazy::OnceCell::new(),
        }
    }

    /// `api`: read-timeout 300s, connect 30s, up to 50 connections, HTTP/1.1.
    /// Used for upstream generation calls.
    pub fn api(&self) -> anyhow::Result<Client> {
        self.api.get_or_try_init(|| self.build(300, 30, 50, true))
    }

    /// `short`: read 60s, connect 15s, up to 20 connections. Used for token
    /// refresh and small summary calls.
    pub fn short(&self) -> anyhow::Result<Client> {
        self.short.get_or_try_init(|| self.build(60, 15, 20, false))
    }

    /// `model`: read 30s, connect 10s, up to 10 connections. Used for
    /// model-list and usage-limit calls.
    pub fn model(&self) -> anyhow::Result<Client> {
        self.model.get_or_try_init(|| self.build(30, 10, 10, false))
    }

    /// Pre-creates all three clients.
    pub fn warmup(&self) -> anyhow::Result<()> {
        self.api()?;
        self.short()?;
        self.model()?;
        Ok(())
    }

    /// No per-client teardown is needed (reqwest clients drop their
    /// connection pools on `Drop`); kept so call sites mirror the donor's
    /// `warmup`/`close_all` lifecycle pair.
    pub fn close_all(&self) {
        self.api.clear();
        self.short.clear();
        self.model.clear();
    }

    fn build(
        &self,
        read_timeout_secs: u64,
        connect_timeout_secs: u64,
        max_idle_per_host: usize,
        http1_only: bool,
    ) -> anyhow::Result<Client> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(read_timeout_secs))
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .pool_max_idle_per_host(max_idle_per_host);

        if http1_only {
            builder = builder.http1_only();
        }

        if self.tls_backend == TlsBackend::Rustls {
            builder = builder.use_rustls_tls();
        }

        if let Some(proxy_config) = &self.proxy {
            let mut proxy = Proxy::all(&proxy_config.url)?;
            if let (Some(username), Some(password)) =
                (&proxy_config.username, &proxy_config.password)
            {
                proxy = proxy.basic_auth(username, password);
            }
            builder = builder.proxy(proxy);
        }

        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_config_new() {
        let config = ProxyConfig::new("http://127.0.0.1:7890");
        assert_eq!(config.url, "http://127.0.0.1:7890");
        assert!(config.username.is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_proxy_config_with_auth() {
        let config = ProxyConfig::new("socks5://127.0.0.1:1080").with_auth("user", "pass");
        assert_eq!(config.url, "socks5://127.0.0.1:1080");
        assert_eq!(config.username, Some("user".to_string()));
        assert_eq!(config.password, Some("pass".to_string()));
    }

    #[test]
    fn test_build_client_without_proxy() {
        let client = build_client(None, 30, TlsBackend::Rustls);
        assert!(client.is_ok());
    }

    #[test]
    fn test_build_client_with_proxy() {
        let config = ProxyConfig::new("http://127.0.0.1:7890");
        let client = build_client(Some(&config), 30, TlsBackend::Rustls);
        assert!(client.is_ok());
    }

    #[test]
    fn test_pool_builds_all_three_clients() {
        let pool = HttpClientPool::new(None, TlsBackend::Rustls);
        assert!(pool.api().is_ok());
        assert!(pool.short().is_ok());
        assert!(pool.model().is_ok());
    }

    #[test]
    fn test_pool_warmup_and_close_all() {
        let pool = HttpClientPool::new(None, TlsBackend::Rustls);
        pool.warmup().unwrap();
        pool.close_all();
        // Clients are lazily rebuilt on next access after close_all.
        assert!(pool.api().is_ok());
    }

    #[test]
    fn test_pool_get_or_try_init_only_builds_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = AtomicUsize::new(0);
        let cell: once_cell_lazy::OnceCell<u32> = once_cell_lazy::OnceCell::new();
        for _ in 0..3 {
            cell.get_or_try_init(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
