mod ingest;
mod maintenance;
mod queries;

pub use ingest::IngestReceipt;
pub use queries::TopMetric;

use crate::payload::{ProcessStatus, SystemMetrics};
use crate::tree::ProcessNode;
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;

const DB_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ошибка SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("фоновая задача хранилища завершилась аварийно: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("версия схемы БД {found} новее поддерживаемой {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("снимок {0} не найден")]
    SnapshotNotFound(i64),
    #[error("хост {0} не найден")]
    HostNotFound(i64),
    #[error("у хоста {0} нет снимков")]
    HostHasNoSnapshots(i64),
}

#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = Self {
            path: Arc::new(path.as_ref().to_path_buf()),
        };
        let version = store.run(init_schema).await?;
        info!(path = %store.path.display(), schema_version = version, "хранилище открыто");
        Ok(store)
    }

    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
    Ok(conn)
}

fn init_schema(conn: &mut Connection) -> Result<i64, StoreError> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > DB_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: DB_SCHEMA_VERSION,
        });
    }
    if found < DB_SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA_V1)?;
        tx.pragma_update(None, "user_version", DB_SCHEMA_VERSION)?;
        tx.commit()?;
    }
    Ok(DB_SCHEMA_VERSION)
}

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS hosts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname      TEXT    NOT NULL UNIQUE,
    ip_address    TEXT,
    os_info       TEXT    NOT NULL DEFAULT '',
    platform      TEXT    NOT NULL DEFAULT 'Unknown',
    architecture  TEXT    NOT NULL DEFAULT 'Unknown',
    cpu_count     INTEGER NOT NULL DEFAULT 1,
    total_memory  INTEGER NOT NULL DEFAULT 0,
    is_active     INTEGER NOT NULL DEFAULT 1,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_hosts_active_last_seen ON hosts (is_active, last_seen_ms);

CREATE TABLE IF NOT EXISTS snapshots (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id               INTEGER NOT NULL REFERENCES hosts (id) ON DELETE CASCADE,
    captured_at_ms        INTEGER NOT NULL,
    total_processes       INTEGER NOT NULL,
    total_cpu_percent     REAL    NOT NULL,
    total_memory_mb       REAL    NOT NULL,
    system_cpu_percent    REAL    NOT NULL,
    system_memory_percent REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_host_time ON snapshots (host_id, captured_at_ms DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_time ON snapshots (captured_at_ms);

CREATE TABLE IF NOT EXISTS processes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id    INTEGER NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
    pid            INTEGER NOT NULL CHECK (pid >= 0),
    ppid           INTEGER CHECK (ppid IS NULL OR ppid >= 0),
    name           TEXT    NOT NULL,
    exe            TEXT,
    cmdline        TEXT,
    status         TEXT    NOT NULL,
    username       TEXT    NOT NULL,
    cpu_percent    REAL    NOT NULL,
    memory_rss     INTEGER NOT NULL,
    memory_vms     INTEGER NOT NULL,
    memory_percent REAL    NOT NULL,
    create_time    REAL,
    num_threads    INTEGER,
    nice           INTEGER
);
CREATE INDEX IF NOT EXISTS idx_processes_snapshot_pid ON processes (snapshot_id, pid);
CREATE INDEX IF NOT EXISTS idx_processes_snapshot_ppid ON processes (snapshot_id, ppid);

CREATE TABLE IF NOT EXISTS system_metrics (
    snapshot_id      INTEGER PRIMARY KEY REFERENCES snapshots (id) ON DELETE CASCADE,
    cpu_percent      REAL,
    memory_percent   REAL,
    cpu_freq_current REAL,
    cpu_freq_min     REAL,
    cpu_freq_max     REAL,
    memory_total     INTEGER,
    memory_available INTEGER,
    memory_used      INTEGER,
    memory_free      INTEGER,
    disk_usage_json  TEXT NOT NULL DEFAULT '[]',
    network_io_json  TEXT
);
";

#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub id: i64,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub os_info: String,
    pub platform: String,
    pub architecture: String,
    pub cpu_count: i64,
    pub total_memory: i64,
    pub total_memory_gb: f64,
    pub is_active: bool,
    pub first_seen: String,
    pub last_seen: String,
    pub uptime_hours: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotView {
    pub id: i64,
    pub host_id: i64,
    pub hostname: String,
    pub timestamp: String,
    pub total_processes: i64,
    pub total_cpu_percent: f64,
    pub total_memory_mb: f64,
    pub total_memory_gb: f64,
    pub system_cpu_percent: f64,
    pub system_memory_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotDetail {
    #[serde(flatten)]
    pub snapshot: SnapshotView,
    pub system_metrics: Option<SystemMetrics>,
    pub processes: Vec<ProcessView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsView {
    pub snapshot_id: i64,
    pub host_id: i64,
    pub hostname: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub metrics: SystemMetrics,
    pub memory_total_gb: Option<f64>,
    pub memory_available_gb: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub host_id: i64,
    pub hostname: String,
    pub platform: String,
    pub is_active: bool,
    pub last_seen: String,
    pub latest_snapshot: Option<SnapshotView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessView {
    pub id: i64,
    pub snapshot_id: i64,
    pub hostname: String,
    pub pid: i64,
    pub ppid: Option<i64>,
    pub name: String,
    pub exe: Option<String>,
    pub cmdline: Option<String>,
    pub status: ProcessStatus,
    pub username: String,
    pub cpu_percent: f64,
    pub memory_rss: i64,
    pub memory_vms: i64,
    pub memory_rss_mb: f64,
    pub memory_vms_mb: f64,
    pub memory_percent: f64,
    pub create_time: Option<f64>,
    pub num_threads: Option<i64>,
    pub nice: Option<i64>,
}

impl ProcessNode for ProcessView {
    fn pid(&self) -> i64 {
        self.pid
    }

    fn ppid(&self) -> Option<i64> {
        self.ppid
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub count: i64,
    pub results: Vec<T>,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn format_ms(ms: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64);
    humantime::format_rfc3339_millis(st).to_string()
}

pub fn parse_rfc3339_ms(text: &str) -> Option<i64> {
    let st = humantime::parse_rfc3339_weak(text.trim()).ok()?;
    st.duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

fn bytes_to_mb(bytes: i64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn like_contains(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ingest::snapshot_totals;
    use crate::payload::{ProcessRecord, Submission};
    use tempfile::TempDir;

    pub async fn temp_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("временный каталог");
        let store = Store::open(dir.path().join("census.db"))
            .await
            .expect("открытие хранилища");
        (dir, store)
    }

    pub fn process(pid: i64, ppid: Option<i64>, name: &str) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            name: name.to_string(),
            exe: None,
            cmdline: None,
            status: ProcessStatus::Sleeping,
            username: "root".to_string(),
            cpu_percent: 0.0,
            memory_rss: 0,
            memory_vms: 0,
            memory_percent: 0.0,
            create_time: None,
            num_threads: Some(1),
            nice: Some(0),
        }
    }

    pub fn submission(hostname: &str, processes: Vec<ProcessRecord>) -> Submission {
        Submission {
            hostname: hostname.to_string(),
            ip_address: Some("10.0.0.5".to_string()),
            os_info: Some("Linux 6.1".to_string()),
            platform: Some("Linux".to_string()),
            architecture: Some("x86_64".to_string()),
            cpu_count: Some(8),
            total_memory: Some(16 << 30),
            processes,
            system_metrics: SystemMetrics::default(),
        }
    }

    pub async fn ingest(store: &Store, sub: Submission) -> IngestReceipt {
        let totals = snapshot_totals(&sub);
        store.ingest(sub, totals).await.expect("сохранение снимка")
    }
}
