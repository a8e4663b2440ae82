use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub cpu_count: Option<i64>,
    #[serde(default)]
    pub total_memory: Option<i64>,
    #[serde(default)]
    pub processes: Vec<ProcessRecord>,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
}

/// Canonical process record. Integer fields are signed so that malformed
/// values reach validation instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: i64,
    #[serde(default)]
    pub ppid: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub exe: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_rss: i64,
    #[serde(default)]
    pub memory_vms: i64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub create_time: Option<f64>,
    #[serde(default)]
    pub num_threads: Option<i64>,
    #[serde(default)]
    pub nice: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Dead,
    #[default]
    Unknown,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Zombie => "zombie",
            ProcessStatus::Dead => "dead",
            ProcessStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(ProcessStatus::Running),
            "sleeping" => Ok(ProcessStatus::Sleeping),
            "stopped" => Ok(ProcessStatus::Stopped),
            "zombie" => Ok(ProcessStatus::Zombie),
            "dead" => Ok(ProcessStatus::Dead),
            "unknown" => Ok(ProcessStatus::Unknown),
            other => Err(format!("неизвестный статус процесса '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub cpu_freq_current: Option<f64>,
    #[serde(default)]
    pub cpu_freq_min: Option<f64>,
    #[serde(default)]
    pub cpu_freq_max: Option<f64>,
    #[serde(default)]
    pub memory_total: Option<i64>,
    #[serde(default)]
    pub memory_available: Option<i64>,
    #[serde(default)]
    pub memory_used: Option<i64>,
    #[serde(default)]
    pub memory_free: Option<i64>,
    #[serde(default)]
    pub disk_usage: Vec<DiskUsage>,
    #[serde(default)]
    pub network_io: Option<NetworkIo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub device: String,
    pub mountpoint: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    #[serde(default)]
    pub packets_sent: u64,
    #[serde(default)]
    pub packets_recv: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAccepted {
    pub id: i64,
    pub host_id: i64,
    pub hostname: String,
    pub timestamp: String,
    pub processes_count: usize,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_process_defaults_to_sentinels() {
        let raw = r#"{"hostname":"h1","processes":[{"pid":1,"ppid":null,"name":"init"}]}"#;
        let sub: Submission = serde_json::from_str(raw).expect("разбор минимальной заявки");
        let p = &sub.processes[0];
        assert_eq!(p.status, ProcessStatus::Unknown);
        assert_eq!(p.username, "");
        assert_eq!(p.memory_rss, 0);
        assert!(p.exe.is_none());
        assert!(sub.system_metrics.cpu_percent.is_none());
        assert!(sub.system_metrics.disk_usage.is_empty());
    }

    #[test]
    fn status_rejects_unlisted_value() {
        let raw = r#"{"pid":1,"name":"x","status":"disk-sleep"}"#;
        assert!(serde_json::from_str::<ProcessRecord>(raw).is_err());
        assert_eq!("Zombie".parse::<ProcessStatus>(), Ok(ProcessStatus::Zombie));
    }
}
