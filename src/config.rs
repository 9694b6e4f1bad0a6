//! Gateway configuration loaded from a JSON file with `${ENV_VAR}` expansion.
//!
//! # Configuration Hierarchy
//!
//! Configuration comes from a JSON document (default `config/gateway.json`).
//! Every string value may reference environment variables as `${VAR}`, which
//! are expanded before deserialization, so secrets like `${JWT_SECRET}` never
//! live in the file. A handful of feature toggles can additionally be
//! overridden directly from the environment after the file is parsed:
//! `ADMIN_ENABLED`, `ADMIN_TOKEN`, `REDIS_ENABLED`, `REDIS_HOST`,
//! `REDIS_PORT`, `REDIS_PASSWORD`, `CACHE_ENABLED`.
//!
//! # Startup Validation
//!
//! `GatewayConfig::load` fails hard (the caller exits 1) on anything that
//! would make the gateway unsafe to run: a missing or short JWT secret,
//! RS256 without key files, TLS enabled without certificate paths.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

/// Minimum JWT secret length for HS256, in bytes.
pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

// =============================================================================
// Server
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on concurrent connections accepted by the listener.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

// =============================================================================
// JWT
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    /// Lifetime of generated access tokens, in seconds.
    #[serde(default = "default_token_expiry")]
    pub access_token_expiry: u64,
    /// `HS256` (default) or `RS256`.
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// PEM public key, required for RS256.
    #[serde(default)]
    pub public_key_file: String,
    /// PEM private key, required for RS256 token generation.
    #[serde(default)]
    pub private_key_file: String,
}

// =============================================================================
// Rate limits
// =============================================================================

/// A `requests / window` pair; `window` is in seconds.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct LimitSpec {
    pub requests: u32,
    pub window: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitsConfig {
    pub global: Option<LimitSpec>,
    pub per_ip: Option<LimitSpec>,
    #[serde(default)]
    pub endpoints: HashMap<String, LimitSpec>,
    /// Per-IP concurrent connection cap enforced by the security validator.
    #[serde(default = "default_per_ip_connections")]
    pub per_ip_connections: u32,
    /// How often the bucket GC wakes, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Buckets idle at least this long are evicted, in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global: None,
            per_ip: None,
            endpoints: HashMap::new(),
            per_ip_connections: default_per_ip_connections(),
            cleanup_interval: default_cleanup_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

// =============================================================================
// Security
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    /// Static response headers, keyed snake_case in the file and translated
    /// to Header-Case at load (e.g. `strict_transport_security`).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub ip_blacklist: Vec<String>,
    /// API key -> identity map; keys act as an alternative to JWT auth.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            allowed_methods: default_allowed_methods(),
            headers: HashMap::new(),
            cors: CorsConfig::default(),
            ip_whitelist: Vec::new(),
            ip_blacklist: Vec::new(),
            api_keys: HashMap::new(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log file path; empty means stderr only.
    #[serde(default)]
    pub file: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// When true the file sink is non-blocking (writes on a worker thread).
    #[serde(default, rename = "async")]
    pub async_writes: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            max_file_size: default_max_file_size(),
            max_files: default_max_files(),
            async_writes: false,
        }
    }
}

// =============================================================================
// Backends
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Interval between backend health probes, in seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before admitting a probe.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

// =============================================================================
// Redis / cache / admin
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_uri")]
    pub uri: String,
    #[serde(default)]
    pub password: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: default_redis_uri(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// TTL applied to cached responses when the route does not override it.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
}

// =============================================================================
// Defaults
// =============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    1024
}
fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}
fn default_token_expiry() -> u64 {
    3600
}
fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}
fn default_per_ip_connections() -> u32 {
    10
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_max_header_size() -> usize {
    8192
}
fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_max_files() -> usize {
    5
}
fn default_health_check_interval() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    60
}
fn default_redis_uri() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_cache_ttl() -> u64 {
    300
}

// =============================================================================
// Loading
// =============================================================================

impl GatewayConfig {
    /// Load, expand, override, and validate configuration from `path`.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let value = load_json_file(path)?;

        let mut config: GatewayConfig = serde_json::from_value(value)
            .map_err(|e| GatewayError::Config(format!("Invalid configuration: {e}")))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Feature toggles the environment may flip without editing the file.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("ADMIN_ENABLED") {
            self.admin.enabled = v;
        }
        if let Ok(token) = std::env::var("ADMIN_TOKEN")
            && !token.is_empty()
        {
            self.admin.token = token;
        }
        if let Some(v) = env_bool("REDIS_ENABLED") {
            self.redis.enabled = v;
        }
        if let Ok(host) = std::env::var("REDIS_HOST")
            && !host.is_empty()
        {
            let port = std::env::var("REDIS_PORT")
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(6379);
            self.redis.uri = format!("redis://{host}:{port}");
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD")
            && !password.is_empty()
        {
            self.redis.password = password;
        }
        if let Some(v) = env_bool("CACHE_ENABLED") {
            self.cache.enabled = v;
        }
    }

    /// Validate settings whose misconfiguration must abort startup.
    fn validate(&self) -> GatewayResult<()> {
        if self.jwt.secret.is_empty() {
            return Err(GatewayError::Config(
                "JWT secret not configured; set JWT_SECRET with a secure random key".to_string(),
            ));
        }

        match self.jwt.algorithm.as_str() {
            "HS256" => {
                if self.jwt.secret.len() < MIN_JWT_SECRET_LEN {
                    return Err(GatewayError::Config(format!(
                        "JWT secret must be at least {MIN_JWT_SECRET_LEN} characters for HS256 \
                         (current length: {})",
                        self.jwt.secret.len()
                    )));
                }
            }
            "RS256" => {
                if self.jwt.public_key_file.is_empty() {
                    return Err(GatewayError::Config(
                        "RS256 requires jwt.public_key_file".to_string(),
                    ));
                }
            }
            other => {
                return Err(GatewayError::Config(format!(
                    "Unsupported JWT algorithm: {other}"
                )));
            }
        }

        if self.jwt.issuer.is_empty() || self.jwt.audience.is_empty() {
            return Err(GatewayError::Config(
                "JWT issuer and audience must be configured".to_string(),
            ));
        }

        if self.server.tls.enabled
            && (self.server.tls.cert_file.is_empty() || self.server.tls.key_file.is_empty())
        {
            return Err(GatewayError::Config(
                "TLS enabled but cert_file/key_file not configured".to_string(),
            ));
        }

        if self.admin.enabled && self.admin.token.is_empty() {
            return Err(GatewayError::Config(
                "Admin API enabled but admin.token not configured".to_string(),
            ));
        }

        Ok(())
    }

    /// Address to bind, `host:port`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Security headers translated from snake_case config keys to Header-Case.
    pub fn security_headers(&self) -> Vec<(String, String)> {
        self.security
            .headers
            .iter()
            .map(|(k, v)| (snake_to_header_case(k), v.clone()))
            .collect()
    }

    /// Redis connection URI with the configured password spliced in.
    pub fn redis_url(&self) -> String {
        if self.redis.password.is_empty() {
            return self.redis.uri.clone();
        }
        match self.redis.uri.strip_prefix("redis://") {
            Some(rest) => format!("redis://:{}@{rest}", self.redis.password),
            None => self.redis.uri.clone(),
        }
    }
}

/// Read a JSON file and expand `${ENV_VAR}` references in every string value.
///
/// Used for both the gateway config and the routes file.
pub fn load_json_file(path: &Path) -> GatewayResult<Value> {
    let content = fs::read_to_string(path).map_err(|e| {
        GatewayError::Config(format!("Could not read {}: {e}", path.display()))
    })?;

    let mut value: Value = serde_json::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("Invalid JSON in {}: {e}", path.display())))?;

    expand_json_env_vars(&mut value);
    Ok(value)
}

/// Expand `${VAR}` references in a string, using empty string for unset vars.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        if let Ok(value) = std::env::var(var_name) {
            result.push_str(&value);
        }
        rest = &rest[start + end + 1..];
    }

    result.push_str(rest);
    result
}

/// Recursively expand environment references in every string of a JSON value.
fn expand_json_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand_env_vars(s);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_json_env_vars(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                expand_json_env_vars(v);
            }
        }
        _ => {}
    }
}

/// `strict_transport_security` -> `Strict-Transport-Security`.
fn snake_to_header_case(key: &str) -> String {
    key.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn minimal_config() -> GatewayConfig {
        serde_json::from_value(serde_json::json!({
            "server": {"host": "127.0.0.1", "port": 9000},
            "jwt": {
                "secret": "0123456789abcdef0123456789abcdef",
                "issuer": "portico",
                "audience": "portico-clients"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = minimal_config();
        assert_eq!(config.server.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.security.max_header_size, 8192);
        assert_eq!(config.backends.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.backends.circuit_breaker.recovery_timeout, 60);
        assert_eq!(config.rate_limits.per_ip_connections, 10);
        assert_eq!(config.rate_limits.cleanup_interval, 300);
        assert_eq!(config.cache.default_ttl, 300);
        assert!(!config.redis.enabled);
        assert!(!config.admin.enabled);
    }

    #[test]
    fn test_validate_accepts_minimal() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_short_hs256_secret() {
        let mut config = minimal_config();
        config.jwt.secret = "too-short".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at least 32"));
    }

    #[test]
    fn test_validate_rejects_missing_issuer() {
        let mut config = minimal_config();
        config.jwt.issuer = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tls_without_files() {
        let mut config = minimal_config();
        config.server.tls.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_admin_without_token() {
        let mut config = minimal_config();
        config.admin.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        // Var names chosen to avoid collisions with other tests in-process.
        unsafe {
            std::env::set_var("PORTICO_TEST_SECRET", "s3cret");
        }
        assert_eq!(
            expand_env_vars("prefix-${PORTICO_TEST_SECRET}-suffix"),
            "prefix-s3cret-suffix"
        );
        assert_eq!(expand_env_vars("${PORTICO_TEST_UNSET_VAR}"), "");
        assert_eq!(expand_env_vars("no placeholders"), "no placeholders");
        assert_eq!(expand_env_vars("dangling ${open"), "dangling ${open");
    }

    #[test]
    fn test_expand_json_env_vars_recurses() {
        unsafe {
            std::env::set_var("PORTICO_TEST_NESTED", "expanded");
        }
        let mut value = serde_json::json!({
            "a": "${PORTICO_TEST_NESTED}",
            "b": {"c": ["${PORTICO_TEST_NESTED}", 42]}
        });
        expand_json_env_vars(&mut value);
        assert_eq!(value["a"], "expanded");
        assert_eq!(value["b"]["c"][0], "expanded");
        assert_eq!(value["b"]["c"][1], 42);
    }

    #[test]
    fn test_snake_to_header_case() {
        assert_eq!(
            snake_to_header_case("strict_transport_security"),
            "Strict-Transport-Security"
        );
        assert_eq!(
            snake_to_header_case("x_content_type_options"),
            "X-Content-Type-Options"
        );
        assert_eq!(snake_to_header_case("server"), "Server");
    }

    #[test]
    fn test_redis_url_with_password() {
        let mut config = minimal_config();
        config.redis.uri = "redis://10.0.0.5:6380".to_string();
        config.redis.password = "hunter2".to_string();
        assert_eq!(config.redis_url(), "redis://:hunter2@10.0.0.5:6380");
    }

    #[test]
    fn test_server_addr_format() {
        let config = minimal_config();
        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }
}
