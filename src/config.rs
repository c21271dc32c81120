use std::{net::IpAddr, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub rate: f64,
    pub burst: u32,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub wait_timeout_ms: u64,
    pub trust_proxy_headers: bool,
}

impl RateLimitConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// `None` means the global limiter rejects immediately instead of waiting.
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_ms > 0).then(|| Duration::from_millis(self.wait_timeout_ms))
    }
}

/// Static limiter parameters for one route pattern.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EndpointLimit {
    pub pattern: String,
    pub rate: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    pub token_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl CsrfConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub login_header: String,
    pub name_header: String,
    #[serde(default)]
    pub admins: Vec<String>,
    /// Peers allowed to set the identity headers. Requests from anywhere else are
    /// treated as anonymous.
    #[serde(default = "loopback")]
    pub trusted_proxies: Vec<IpAddr>,
}

fn loopback() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1]), IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1])]
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointLimit>,
    pub csrf: CsrfConfig,
    pub identity: IdentityConfig,
}

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
        {
            Ok(cfg) => match cfg.try_deserialize() {
                Ok(app_cfg) => app_cfg,
                Err(e) => {
                    eprintln!("FATAL: Failed to deserialize default config: {}", e);
                    panic!("Failed to deserialize default config: {}", e);
                }
            },
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: boardwarden.toml (in CWD)
        .add_source(::config::File::with_name("boardwarden").required(false));

    if let Ok(custom_path) = std::env::var("BOARDWARDEN_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(::config::Environment::with_prefix("BOARDWARDEN").separator("__"));

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

fn validate_limit(what: &str, rate: f64, burst: u32) -> anyhow::Result<()> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(anyhow::anyhow!("{}.rate must be a finite number >= 0, got {}", what, rate));
    }
    if burst == 0 {
        return Err(anyhow::anyhow!("{}.burst must be >= 1", what));
    }
    Ok(())
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    // Server
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }

    // Rate limiting
    validate_limit("rate_limit", cfg.rate_limit.rate, cfg.rate_limit.burst)?;
    if cfg.rate_limit.idle_ttl_secs == 0 {
        return Err(anyhow::anyhow!("rate_limit.idle_ttl_secs must be > 0"));
    }
    if cfg.rate_limit.sweep_interval_secs == 0 {
        return Err(anyhow::anyhow!("rate_limit.sweep_interval_secs must be > 0"));
    }
    for ep in &cfg.endpoints {
        validate_limit(&format!("endpoints[{}]", ep.pattern), ep.rate, ep.burst)?;
        globset::Glob::new(&ep.pattern)
            .map_err(|e| anyhow::anyhow!("invalid endpoint pattern {:?}: {}", ep.pattern, e))?;
    }

    // CSRF
    if cfg.csrf.token_ttl_secs == 0 {
        return Err(anyhow::anyhow!("csrf.token_ttl_secs must be > 0"));
    }
    if cfg.csrf.sweep_interval_secs == 0 {
        return Err(anyhow::anyhow!("csrf.sweep_interval_secs must be > 0"));
    }

    // Identity
    if cfg.identity.login_header.trim().is_empty() {
        return Err(anyhow::anyhow!("identity.login_header must not be empty"));
    }
    if axum::http::HeaderName::try_from(cfg.identity.login_header.as_str()).is_err() {
        return Err(anyhow::anyhow!("identity.login_header is not a valid header name"));
    }

    Ok(())
}
