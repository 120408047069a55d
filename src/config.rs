//! TOML configuration and validation

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `server.max_body_bytes`, leaving room under the backend's
/// argument limit for the rest of the event
pub const BODY_LIMIT_CEILING: usize = 96 * 1024;

/// Global configuration for the adapter
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The executable every request is handed to
    pub backend: BackendConfig,

    /// Cross-origin headers attached to responses
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the admin API on 127.0.0.1 (default: 8081, 0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Largest request body collected into an event (default: 64 KiB, at most 96 KiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            max_body_bytes: default_max_body_bytes(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_port > 0
    }
}

/// Configuration for the backend executable
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// adapter, once per request. Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command to execute. When `args` is empty the command string is split
    /// shell-style, so `command = "python app.py"` works.
    pub command: String,

    /// Arguments placed before the serialized event
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Upper bound on backend runtime in seconds (absent: wait forever)
    pub timeout_secs: Option<u64>,
}

impl BackendConfig {
    /// Create a backend config for a command with no extra arguments
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Resolve the program and its leading arguments.
    pub fn program(&self) -> anyhow::Result<(String, Vec<String>)> {
        if !self.args.is_empty() {
            return Ok((self.command.clone(), self.args.clone()));
        }

        let mut words = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("Invalid backend command '{}': {}", self.command, e))?;
        if words.is_empty() {
            anyhow::bail!("Backend command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend 'command' must not be empty".to_string());
        } else if let Err(e) = self.program() {
            errors.push(e.to_string());
        }

        if self.timeout_secs == Some(0) {
            errors.push("backend 'timeout_secs' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

/// Cross-origin header values
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CorsConfig {
    #[serde(default = "default_allow_origin")]
    pub allow_origin: String,

    #[serde(default = "default_allow_headers")]
    pub allow_headers: String,

    #[serde(default = "default_allow_methods")]
    pub allow_methods: String,

    /// Attach `Access-Control-Allow-Origin` to backend-failure responses too.
    /// Off by default: failure responses historically carry no CORS header.
    #[serde(default)]
    pub on_error: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: default_allow_origin(),
            allow_headers: default_allow_headers(),
            allow_methods: default_allow_methods(),
            on_error: false,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_admin_port() -> u16 {
    8081
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_allow_origin() -> String {
    "*".to_string()
}

fn default_allow_headers() -> String {
    "Content-Type".to_string()
}

fn default_allow_methods() -> String {
    "GET, POST, PUT, DELETE".to_string()
}

impl Config {
    /// Build a config around a backend, everything else defaulted
    pub fn with_backend(backend: BackendConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            backend,
            cors: CorsConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.as_ref().display(), e)
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.backend.validate() {
            errors.push(e);
        }

        if self.server.port == 0 {
            errors.push("server 'port' must be greater than 0".to_string());
        }

        if self.server.max_body_bytes == 0 {
            errors.push("server 'max_body_bytes' must be greater than 0".to_string());
        } else if self.server.max_body_bytes > BODY_LIMIT_CEILING {
            errors.push(format!(
                "server 'max_body_bytes' must not exceed {} (events are passed as a single process argument)",
                BODY_LIMIT_CEILING
            ));
        }

        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server 'tls_cert' and 'tls_key' must be set together".to_string());
        }

        for (key, value) in [
            ("allow_origin", &self.cors.allow_origin),
            ("allow_headers", &self.cors.allow_headers),
            ("allow_methods", &self.cors.allow_methods),
        ] {
            if hyper::header::HeaderValue::from_str(value).is_err() {
                errors.push(format!("cors '{}' is not a valid header value", key));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }
}
