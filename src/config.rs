use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    #[serde(default = "default_excluded_names")]
    pub excluded_names: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_collect_system_metrics")]
    pub collect_system_metrics: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_processes_per_snapshot")]
    pub max_processes_per_snapshot: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,
    #[serde(default = "default_max_top_n")]
    pub max_top_n: usize,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_inactive_after_secs")]
    pub inactive_after_secs: u64,
    #[serde(default)]
    pub snapshot_max_age_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            api_key_env: default_api_key_env(),
            api_key: None,
            interval_secs: default_interval_secs(),
            max_processes: default_max_processes(),
            excluded_names: default_excluded_names(),
            request_timeout_secs: default_request_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            collect_system_metrics: default_collect_system_metrics(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_path: default_database_path(),
            api_key_env: default_api_key_env(),
            api_key: None,
            max_body_bytes: default_max_body_bytes(),
            max_processes_per_snapshot: default_max_processes_per_snapshot(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            default_top_n: default_top_n(),
            max_top_n: default_max_top_n(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            inactive_after_secs: default_inactive_after_secs(),
            snapshot_max_age_secs: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent(&self.agent)?;
        validate_server(&self.server)?;
        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl AgentConfig {
    pub fn normalized_excluded_names(&self) -> Vec<String> {
        self.excluded_names
            .iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect()
    }
}

pub fn resolve_api_key(env_name: &str, inline: Option<&str>) -> Result<String, String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Ok(v.trim().to_string());
        }
    }
    if let Some(v) = inline.map(str::trim).filter(|v| !v.is_empty()) {
        return Ok(v.to_string());
    }
    Err(format!(
        "не найден API-ключ: задайте '{}' в окружении или api_key в config",
        env_name
    ))
}

fn validate_agent(cfg: &AgentConfig) -> Result<(), ConfigError> {
    let url = cfg.backend_url.trim();
    if url.is_empty() {
        return Err(ConfigError::Validation(
            "agent.backend_url обязательно".to_string(),
        ));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::Validation(
            "agent.backend_url должен начинаться с http:// или https://".to_string(),
        ));
    }
    if cfg.interval_secs < 10 {
        return Err(ConfigError::Validation(
            "agent.interval_secs должно быть >= 10".to_string(),
        ));
    }
    if cfg.max_processes < 100 {
        return Err(ConfigError::Validation(
            "agent.max_processes должно быть >= 100".to_string(),
        ));
    }
    if cfg.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "agent.request_timeout_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.retry_attempts < 1 {
        return Err(ConfigError::Validation(
            "agent.retry_attempts должно быть >= 1".to_string(),
        ));
    }
    if cfg.max_retry_delay_ms < cfg.retry_delay_ms {
        return Err(ConfigError::Validation(
            "agent.max_retry_delay_ms должно быть >= retry_delay_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(cfg: &ServerConfig) -> Result<(), ConfigError> {
    if cfg.listen.trim().is_empty() {
        return Err(ConfigError::Validation(
            "поле server.listen обязательно".to_string(),
        ));
    }
    if SocketAddr::from_str(&cfg.listen).is_err() {
        return Err(ConfigError::Validation(
            "поле server.listen должно быть корректным адресом host:port".to_string(),
        ));
    }
    if cfg.database_path.trim().is_empty() {
        return Err(ConfigError::Validation(
            "server.database_path не должен быть пустым".to_string(),
        ));
    }
    if cfg.max_body_bytes < 1024 {
        return Err(ConfigError::Validation(
            "server.max_body_bytes должно быть >= 1024".to_string(),
        ));
    }
    if cfg.max_processes_per_snapshot < 1 {
        return Err(ConfigError::Validation(
            "server.max_processes_per_snapshot должно быть >= 1".to_string(),
        ));
    }
    if cfg.max_page_size < 1 || cfg.default_page_size < 1 {
        return Err(ConfigError::Validation(
            "server.max_page_size и default_page_size должны быть >= 1".to_string(),
        ));
    }
    if cfg.default_page_size > cfg.max_page_size {
        return Err(ConfigError::Validation(
            "server.default_page_size не может превышать max_page_size".to_string(),
        ));
    }
    if cfg.max_top_n < 1 || cfg.default_top_n < 1 || cfg.default_top_n > cfg.max_top_n {
        return Err(ConfigError::Validation(
            "server.default_top_n должно быть в диапазоне 1..max_top_n".to_string(),
        ));
    }
    if cfg.retention.sweep_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "server.retention.sweep_interval_secs должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000/api/v1".to_string()
}

fn default_api_key_env() -> String {
    "PROCCENSUS_API_KEY".to_string()
}

const fn default_interval_secs() -> u64 {
    60
}

const fn default_max_processes() -> usize {
    1000
}

fn default_excluded_names() -> Vec<String> {
    ["cursor", "chrome", "firefox", "safari"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    5000
}

const fn default_max_retry_delay_ms() -> u64 {
    60_000
}

const fn default_collect_system_metrics() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_database_path() -> String {
    "./proccensus.db".to_string()
}

const fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

const fn default_max_processes_per_snapshot() -> usize {
    10_000
}

const fn default_page_size() -> usize {
    100
}

const fn default_max_page_size() -> usize {
    1000
}

const fn default_top_n() -> usize {
    10
}

const fn default_max_top_n() -> usize {
    100
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

const fn default_inactive_after_secs() -> u64 {
    86_400
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_example_is_valid() {
        let cfg: Config =
            serde_yaml::from_str(Config::example_yaml()).expect("пример конфигурации разбирается");
        cfg.validate().expect("пример конфигурации валиден");
        assert_eq!(cfg.server.max_page_size, 1000);
    }

    #[test]
    fn agent_only_file_gets_server_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "agent:\n  backend_url: https://census.example/api/v1\n  interval_secs: 30\n",
        )
        .expect("разбор yaml");
        cfg.validate().expect("валидация");
        assert_eq!(cfg.agent.interval_secs, 30);
        assert_eq!(cfg.agent.max_processes, 1000);
        assert_eq!(cfg.server.listen, "0.0.0.0:8000");
    }

    #[test]
    fn short_interval_is_rejected() {
        let mut cfg = Config::default();
        cfg.agent.interval_secs = 5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn page_size_bounds_are_checked() {
        let mut cfg = Config::default();
        cfg.server.default_page_size = 2000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_excluded_names_are_dropped() {
        let cfg = AgentConfig {
            excluded_names: vec![" Chrome ".to_string(), "".to_string(), "  ".to_string()],
            ..AgentConfig::default()
        };
        assert_eq!(cfg.normalized_excluded_names(), vec!["chrome".to_string()]);
    }

    #[test]
    fn inline_api_key_used_when_env_missing() {
        std::env::remove_var("PROCCENSUS_TEST_MISSING_KEY");
        let key = resolve_api_key("PROCCENSUS_TEST_MISSING_KEY", Some(" s3cret "))
            .expect("ключ из конфигурации");
        assert_eq!(key, "s3cret");
        assert!(resolve_api_key("PROCCENSUS_TEST_MISSING_KEY", None).is_err());
    }
}
