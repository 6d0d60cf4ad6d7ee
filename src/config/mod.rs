use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_MODEL: &str = "llama3";
pub const DEFAULT_MODEL_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";
pub const DEFAULT_TRANSPORT: TransportKind = TransportKind::Stdio;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_READINESS_WAIT_MS: u64 = 1500;
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MODEL_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("backend key '{key}' is declared more than once")]
    DuplicateBackend { key: String },
}

/// How a backend exposes its protocol channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Tcp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub model_endpoint: String,
    pub system_prompt: Option<String>,
    pub max_tool_rounds: usize,
    pub model_timeout: Duration,
    pub backends: Vec<BackendConfig>,
}

/// A fully resolved backend description, consumed exactly once by the
/// supervisor to produce a running process.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub key: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub readiness_wait: Duration,
    pub invoke_timeout: Duration,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    model_endpoint: Option<String>,
    system_prompt: Option<String>,
    max_tool_rounds: Option<usize>,
    model_timeout_ms: Option<u64>,
    #[serde(default)]
    backends: Vec<RawBackend>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBackend {
    key: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    workdir: Option<String>,
    transport: Option<TransportKind>,
    host: Option<String>,
    port: Option<u16>,
    readiness_wait_ms: Option<u64>,
    invoke_timeout_ms: Option<u64>,
}

impl From<RawBackend> for BackendConfig {
    fn from(raw: RawBackend) -> Self {
        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        Self {
            key: raw.key,
            command: PathBuf::from(expand(&raw.command)),
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw.env,
            workdir: raw.workdir.map(|dir| PathBuf::from(expand(&dir))),
            transport: raw.transport.unwrap_or(DEFAULT_TRANSPORT),
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            readiness_wait: Duration::from_millis(
                raw.readiness_wait_ms.unwrap_or(DEFAULT_READINESS_WAIT_MS),
            ),
            invoke_timeout: Duration::from_millis(
                raw.invoke_timeout_ms.unwrap_or(DEFAULT_INVOKE_TIMEOUT_MS),
            ),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            model_endpoint: DEFAULT_MODEL_ENDPOINT.to_string(),
            system_prompt: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            model_timeout: Duration::from_millis(DEFAULT_MODEL_TIMEOUT_MS),
            backends: Vec::new(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading agent configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    for backend in &parsed.backends {
        if !seen.insert(backend.key.clone()) {
            return Err(ConfigError::DuplicateBackend {
                key: backend.key.clone(),
            });
        }
    }

    Ok(AppConfig {
        model: parsed.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        model_endpoint: parsed
            .model_endpoint
            .unwrap_or_else(|| DEFAULT_MODEL_ENDPOINT.to_string()),
        system_prompt: parsed.system_prompt,
        max_tool_rounds: parsed.max_tool_rounds.unwrap_or(DEFAULT_MAX_TOOL_ROUNDS),
        model_timeout: Duration::from_millis(
            parsed.model_timeout_ms.unwrap_or(DEFAULT_MODEL_TIMEOUT_MS),
        ),
        backends: parsed.backends.into_iter().map(BackendConfig::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("agent.toml");
        fs::write(&path, content).expect("write config");
        path
    }

    #[test]
    fn reads_model_and_backends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            r#"
model = "mistral"
max_tool_rounds = 2

[[backends]]
key = "notion"
command = "/usr/local/bin/mock-backend"
args = ["--verbose"]
transport = "tcp"
port = 9100
"#,
        );

        let config = AppConfig::load(Some(&path)).expect("load config");
        assert_eq!(config.model, "mistral");
        assert_eq!(config.max_tool_rounds, 2);
        assert_eq!(config.backends.len(), 1);

        let backend = &config.backends[0];
        assert_eq!(backend.key, "notion");
        assert_eq!(backend.transport, TransportKind::Tcp);
        assert_eq!(backend.port, 9100);
        assert_eq!(backend.host, DEFAULT_HOST);
        assert_eq!(
            backend.readiness_wait,
            Duration::from_millis(DEFAULT_READINESS_WAIT_MS)
        );
    }

    #[test]
    fn missing_optional_backend_fields_get_transport_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            r#"
[[backends]]
key = "files"
command = "mock-backend"
"#,
        );

        let config = AppConfig::load(Some(&path)).expect("load config");
        let backend = &config.backends[0];
        assert_eq!(backend.transport, DEFAULT_TRANSPORT);
        assert_eq!(backend.host, DEFAULT_HOST);
        assert_eq!(backend.port, DEFAULT_PORT);
        assert!(backend.args.is_empty());
        assert!(backend.env.is_empty());
        assert_eq!(
            backend.invoke_timeout,
            Duration::from_millis(DEFAULT_INVOKE_TIMEOUT_MS)
        );
    }

    #[test]
    fn rejects_duplicate_backend_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            dir.path(),
            r#"
[[backends]]
key = "notion"
command = "a"

[[backends]]
key = "notion"
command = "b"
"#,
        );

        let result = AppConfig::load(Some(&path));
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateBackend { key }) if key == "notion"
        ));
    }

    #[test]
    fn expands_env_vars_in_command_and_args() {
        unsafe {
            std::env::set_var("TEST_AGENT_ROOT", "/opt/agent");
        }

        let raw = RawBackend {
            key: "test".to_string(),
            command: "${TEST_AGENT_ROOT}/backend".to_string(),
            args: vec!["--root".to_string(), "${TEST_AGENT_ROOT}".to_string()],
            env: HashMap::new(),
            workdir: Some("${TEST_AGENT_ROOT}/work".to_string()),
            transport: None,
            host: None,
            port: None,
            readiness_wait_ms: None,
            invoke_timeout_ms: None,
        };

        let config = BackendConfig::from(raw);
        assert_eq!(config.command, PathBuf::from("/opt/agent/backend"));
        assert!(config.args.contains(&"/opt/agent".to_string()));
        assert_eq!(config.workdir, Some(PathBuf::from("/opt/agent/work")));

        unsafe {
            std::env::remove_var("TEST_AGENT_ROOT");
        }
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/agent.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
