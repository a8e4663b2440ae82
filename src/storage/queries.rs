use super::{
    bytes_to_mb, format_ms, like_contains, now_ms, round2, HostSummary, HostView, Page,
    ProcessView, SnapshotDetail, SnapshotView, Store, StoreError, SystemMetricsView, BYTES_PER_GB,
};
use crate::payload::{DiskUsage, NetworkIo, SystemMetrics};
use crate::query::{HostFilter, PageRequest, ProcessFilter, SnapshotFilter};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopMetric {
    Cpu,
    Memory,
}

impl TopMetric {
    fn column(self) -> &'static str {
        match self {
            TopMetric::Cpu => "p.cpu_percent",
            TopMetric::Memory => "p.memory_rss",
        }
    }
}

const HOST_COLUMNS: &str = "h.id, h.hostname, h.ip_address, h.os_info, h.platform, h.architecture, \
     h.cpu_count, h.total_memory, h.is_active, h.first_seen_ms, h.last_seen_ms";

const SNAPSHOT_COLUMNS: &str = "s.id, s.host_id, h.hostname, s.captured_at_ms, s.total_processes, \
     s.total_cpu_percent, s.total_memory_mb, s.system_cpu_percent, s.system_memory_percent";

const SNAPSHOT_FROM: &str = "FROM snapshots s JOIN hosts h ON h.id = s.host_id";

const PROCESS_COLUMNS: &str = "p.id, p.snapshot_id, h.hostname, p.pid, p.ppid, p.name, p.exe, \
     p.cmdline, p.status, p.username, p.cpu_percent, p.memory_rss, p.memory_vms, \
     p.memory_percent, p.create_time, p.num_threads, p.nice";

const LATEST_SNAPSHOT_OF_H: &str = "(SELECT s2.id FROM snapshots s2 WHERE s2.host_id = h.id \
     ORDER BY s2.captured_at_ms DESC, s2.id DESC LIMIT 1)";

#[derive(Default)]
struct Where {
    clauses: Vec<&'static str>,
    values: Vec<Value>,
}

impl Where {
    fn push(&mut self, clause: &'static str, value: impl Into<Value>) {
        self.clauses.push(clause);
        self.values.push(value.into());
    }

    fn push_like(&mut self, clause: &'static str, needle: Option<&str>) {
        if let Some(needle) = needle.map(str::trim).filter(|n| !n.is_empty()) {
            self.push(clause, like_contains(needle));
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn count(&self, conn: &Connection, from: &str) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) {from}{}", self.sql());
        Ok(conn.query_row(&sql, params_from_iter(self.values.iter()), |r| r.get(0))?)
    }

    fn select<T>(
        &self,
        conn: &Connection,
        head: &str,
        tail: &str,
        extra: &[Value],
        map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StoreError> {
        let sql = format!("{head}{}{tail}", self.sql());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(self.values.iter().chain(extra)), map)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn page_values(page: PageRequest) -> [Value; 2] {
    [
        Value::Integer(page.limit as i64),
        Value::Integer(page.offset as i64),
    ]
}

fn host_from_row(row: &Row<'_>, now: i64) -> rusqlite::Result<HostView> {
    let total_memory: i64 = row.get(7)?;
    let first_seen_ms: i64 = row.get(9)?;
    let last_seen_ms: i64 = row.get(10)?;
    Ok(HostView {
        id: row.get(0)?,
        hostname: row.get(1)?,
        ip_address: row.get(2)?,
        os_info: row.get(3)?,
        platform: row.get(4)?,
        architecture: row.get(5)?,
        cpu_count: row.get(6)?,
        total_memory,
        total_memory_gb: round2(total_memory as f64 / BYTES_PER_GB),
        is_active: row.get(8)?,
        first_seen: format_ms(first_seen_ms),
        last_seen: format_ms(last_seen_ms),
        uptime_hours: round2((now - first_seen_ms).max(0) as f64 / 3_600_000.0),
    })
}

fn snapshot_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<SnapshotView> {
    let total_memory_mb: f64 = row.get(base + 6)?;
    Ok(SnapshotView {
        id: row.get(base)?,
        host_id: row.get(base + 1)?,
        hostname: row.get(base + 2)?,
        timestamp: format_ms(row.get(base + 3)?),
        total_processes: row.get(base + 4)?,
        total_cpu_percent: row.get(base + 5)?,
        total_memory_mb,
        total_memory_gb: round2(total_memory_mb / 1024.0),
        system_cpu_percent: row.get(base + 7)?,
        system_memory_percent: row.get(base + 8)?,
    })
}

fn process_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessView> {
    let status: String = row.get(8)?;
    let memory_rss: i64 = row.get(11)?;
    let memory_vms: i64 = row.get(12)?;
    Ok(ProcessView {
        id: row.get(0)?,
        snapshot_id: row.get(1)?,
        hostname: row.get(2)?,
        pid: row.get(3)?,
        ppid: row.get(4)?,
        name: row.get(5)?,
        exe: row.get(6)?,
        cmdline: row.get(7)?,
        status: status.parse().unwrap_or_default(),
        username: row.get(9)?,
        cpu_percent: row.get(10)?,
        memory_rss,
        memory_vms,
        memory_rss_mb: round2(bytes_to_mb(memory_rss)),
        memory_vms_mb: round2(bytes_to_mb(memory_vms)),
        memory_percent: row.get(13)?,
        create_time: row.get(14)?,
        num_threads: row.get(15)?,
        nice: row.get(16)?,
    })
}

/// FROM clause and filters for a process query. Without an explicit
/// snapshot the scope is the newest snapshot of every active host.
fn process_scope(filter: &ProcessFilter) -> (String, Where) {
    let mut w = Where::default();
    let from = match filter.snapshot {
        Some(snapshot_id) => {
            w.push("p.snapshot_id = ?", snapshot_id);
            "FROM processes p JOIN snapshots s ON s.id = p.snapshot_id \
             JOIN hosts h ON h.id = s.host_id"
                .to_string()
        }
        None => format!(
            "FROM (SELECT {LATEST_SNAPSHOT_OF_H} AS snapshot_id FROM hosts h WHERE h.is_active = 1) latest \
             JOIN processes p ON p.snapshot_id = latest.snapshot_id \
             JOIN snapshots s ON s.id = p.snapshot_id \
             JOIN hosts h ON h.id = s.host_id"
        ),
    };

    w.push_like("p.name LIKE ? ESCAPE '\\'", filter.name.as_deref());
    if let Some(status) = filter.status {
        w.push("p.status = ?", status.as_str().to_string());
    }
    w.push_like("p.username LIKE ? ESCAPE '\\'", filter.username.as_deref());
    if let Some(v) = filter.min_cpu {
        w.push("p.cpu_percent >= ?", v);
    }
    if let Some(v) = filter.max_cpu {
        w.push("p.cpu_percent <= ?", v);
    }
    if let Some(v) = filter.min_memory {
        w.push("p.memory_rss >= ?", v);
    }
    if let Some(v) = filter.max_memory {
        w.push("p.memory_rss <= ?", v);
    }
    w.push_like("h.hostname LIKE ? ESCAPE '\\'", filter.hostname.as_deref());
    (from, w)
}

fn host_exists(conn: &Connection, host_id: i64) -> Result<(), StoreError> {
    conn.query_row("SELECT 1 FROM hosts WHERE id = ?1", [host_id], |_| Ok(()))
        .optional()?
        .ok_or(StoreError::HostNotFound(host_id))
}

fn snapshot_exists(conn: &Connection, snapshot_id: i64) -> Result<(), StoreError> {
    conn.query_row(
        "SELECT 1 FROM snapshots WHERE id = ?1",
        [snapshot_id],
        |_| Ok(()),
    )
    .optional()?
    .ok_or(StoreError::SnapshotNotFound(snapshot_id))
}

fn processes_of_snapshot(
    conn: &Connection,
    snapshot_id: i64,
) -> Result<Vec<ProcessView>, StoreError> {
    let sql = format!(
        "SELECT {PROCESS_COLUMNS} FROM processes p JOIN snapshots s ON s.id = p.snapshot_id \
         JOIN hosts h ON h.id = s.host_id WHERE p.snapshot_id = ?1 ORDER BY p.id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([snapshot_id], process_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

const METRICS_COLUMNS: &str = "m.cpu_percent, m.memory_percent, m.cpu_freq_current, \
     m.cpu_freq_min, m.cpu_freq_max, m.memory_total, m.memory_available, m.memory_used, \
     m.memory_free, m.disk_usage_json, m.network_io_json";

const METRICS_FROM: &str = "FROM system_metrics m JOIN snapshots s ON s.id = m.snapshot_id \
     JOIN hosts h ON h.id = s.host_id";

type RawMetrics = (SystemMetrics, String, Option<String>);

fn metrics_from_row(r: &Row<'_>, base: usize) -> rusqlite::Result<RawMetrics> {
    Ok((
        SystemMetrics {
            cpu_percent: r.get(base)?,
            memory_percent: r.get(base + 1)?,
            cpu_freq_current: r.get(base + 2)?,
            cpu_freq_min: r.get(base + 3)?,
            cpu_freq_max: r.get(base + 4)?,
            memory_total: r.get(base + 5)?,
            memory_available: r.get(base + 6)?,
            memory_used: r.get(base + 7)?,
            memory_free: r.get(base + 8)?,
            disk_usage: Vec::new(),
            network_io: None,
        },
        r.get(base + 9)?,
        r.get(base + 10)?,
    ))
}

fn decode_metrics((mut metrics, disks, network): RawMetrics) -> Result<SystemMetrics, StoreError> {
    metrics.disk_usage = serde_json::from_str::<Vec<DiskUsage>>(&disks)?;
    metrics.network_io = network
        .as_deref()
        .map(serde_json::from_str::<NetworkIo>)
        .transpose()?;
    Ok(metrics)
}

fn metrics_view_from_row(r: &Row<'_>) -> rusqlite::Result<(i64, i64, String, i64, RawMetrics)> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, metrics_from_row(r, 4)?))
}

fn into_metrics_views(
    rows: Vec<(i64, i64, String, i64, RawMetrics)>,
) -> Result<Vec<SystemMetricsView>, StoreError> {
    rows.into_iter()
        .map(|(snapshot_id, host_id, hostname, captured_at_ms, raw)| {
            let metrics = decode_metrics(raw)?;
            let gb = |bytes: Option<i64>| bytes.map(|b| round2(b as f64 / BYTES_PER_GB));
            Ok(SystemMetricsView {
                snapshot_id,
                host_id,
                hostname,
                timestamp: format_ms(captured_at_ms),
                memory_total_gb: gb(metrics.memory_total),
                memory_available_gb: gb(metrics.memory_available),
                metrics,
            })
        })
        .collect()
}

fn system_metrics_of(
    conn: &Connection,
    snapshot_id: i64,
) -> Result<Option<SystemMetrics>, StoreError> {
    conn.query_row(
        &format!("SELECT {METRICS_COLUMNS} FROM system_metrics m WHERE m.snapshot_id = ?1"),
        [snapshot_id],
        |r| metrics_from_row(r, 0),
    )
    .optional()?
    .map(decode_metrics)
    .transpose()
}

impl Store {
    pub async fn hosts(
        &self,
        filter: HostFilter,
        page: PageRequest,
    ) -> Result<Page<HostView>, StoreError> {
        self.run(move |conn| {
            let mut w = Where::default();
            if let Some(platform) = filter.platform.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                w.push("h.platform = ? COLLATE NOCASE", platform.to_string());
            }
            if let Some(active) = filter.is_active {
                w.push("h.is_active = ?", i64::from(active));
            }
            w.push_like("h.hostname LIKE ? ESCAPE '\\'", filter.hostname.as_deref());

            let from = "FROM hosts h";
            let count = w.count(conn, from)?;
            let now = now_ms();
            let results = w.select(
                conn,
                &format!("SELECT {HOST_COLUMNS} {from}"),
                " ORDER BY h.last_seen_ms DESC, h.id DESC LIMIT ? OFFSET ?",
                &page_values(page),
                |row| host_from_row(row, now),
            )?;
            Ok(Page { count, results })
        })
        .await
    }

    pub async fn host(&self, host_id: i64) -> Result<HostView, StoreError> {
        self.run(move |conn| {
            let now = now_ms();
            conn.query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts h WHERE h.id = ?1"),
                [host_id],
                |row| host_from_row(row, now),
            )
            .optional()?
            .ok_or(StoreError::HostNotFound(host_id))
        })
        .await
    }

    pub async fn host_summaries(&self) -> Result<Vec<HostSummary>, StoreError> {
        self.run(|conn| {
            let sql = format!(
                "SELECT h.id, h.hostname, h.platform, h.is_active, h.last_seen_ms, {SNAPSHOT_COLUMNS}
                 FROM hosts h LEFT JOIN snapshots s ON s.id = {LATEST_SNAPSHOT_OF_H}
                 WHERE h.is_active = 1
                 ORDER BY h.hostname"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    let snapshot_id: Option<i64> = row.get(5)?;
                    Ok(HostSummary {
                        host_id: row.get(0)?,
                        hostname: row.get(1)?,
                        platform: row.get(2)?,
                        is_active: row.get(3)?,
                        last_seen: format_ms(row.get(4)?),
                        latest_snapshot: match snapshot_id {
                            Some(_) => Some(snapshot_from_row(row, 5)?),
                            None => None,
                        },
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn host_snapshots(
        &self,
        host_id: i64,
        page: PageRequest,
    ) -> Result<Page<SnapshotView>, StoreError> {
        self.run(move |conn| {
            host_exists(conn, host_id)?;
            let mut w = Where::default();
            w.push("s.host_id = ?", host_id);
            let count = w.count(conn, SNAPSHOT_FROM)?;
            let results = w.select(
                conn,
                &format!("SELECT {SNAPSHOT_COLUMNS} {SNAPSHOT_FROM}"),
                " ORDER BY s.captured_at_ms DESC, s.id DESC LIMIT ? OFFSET ?",
                &page_values(page),
                |row| snapshot_from_row(row, 0),
            )?;
            Ok(Page { count, results })
        })
        .await
    }

    pub async fn host_latest_snapshot_id(&self, host_id: i64) -> Result<i64, StoreError> {
        self.run(move |conn| {
            host_exists(conn, host_id)?;
            conn.query_row(
                "SELECT id FROM snapshots WHERE host_id = ?1
                 ORDER BY captured_at_ms DESC, id DESC LIMIT 1",
                [host_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or(StoreError::HostHasNoSnapshots(host_id))
        })
        .await
    }

    pub async fn snapshots(
        &self,
        filter: SnapshotFilter,
        page: PageRequest,
    ) -> Result<Page<SnapshotView>, StoreError> {
        self.run(move |conn| {
            let mut w = Where::default();
            w.push_like("h.hostname LIKE ? ESCAPE '\\'", filter.hostname.as_deref());
            if let Some(start) = filter.start_ms {
                w.push("s.captured_at_ms >= ?", start);
            }
            if let Some(end) = filter.end_ms {
                w.push("s.captured_at_ms <= ?", end);
            }
            let count = w.count(conn, SNAPSHOT_FROM)?;
            let results = w.select(
                conn,
                &format!("SELECT {SNAPSHOT_COLUMNS} {SNAPSHOT_FROM}"),
                " ORDER BY s.captured_at_ms DESC, s.id DESC LIMIT ? OFFSET ?",
                &page_values(page),
                |row| snapshot_from_row(row, 0),
            )?;
            Ok(Page { count, results })
        })
        .await
    }

    pub async fn latest_snapshots(
        &self,
        hostname: Option<String>,
    ) -> Result<Vec<SnapshotView>, StoreError> {
        self.run(move |conn| {
            let mut w = Where::default();
            w.clauses.push("h.is_active = 1");
            w.push_like("h.hostname LIKE ? ESCAPE '\\'", hostname.as_deref());
            w.select(
                conn,
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM hosts h \
                     JOIN snapshots s ON s.id = {LATEST_SNAPSHOT_OF_H}"
                ),
                " ORDER BY h.hostname",
                &[],
                |row| snapshot_from_row(row, 0),
            )
        })
        .await
    }

    pub async fn snapshot(&self, snapshot_id: i64) -> Result<SnapshotDetail, StoreError> {
        self.run(move |conn| {
            let snapshot = conn
                .query_row(
                    &format!("SELECT {SNAPSHOT_COLUMNS} {SNAPSHOT_FROM} WHERE s.id = ?1"),
                    [snapshot_id],
                    |row| snapshot_from_row(row, 0),
                )
                .optional()?
                .ok_or(StoreError::SnapshotNotFound(snapshot_id))?;
            Ok(SnapshotDetail {
                snapshot,
                system_metrics: system_metrics_of(conn, snapshot_id)?,
                processes: processes_of_snapshot(conn, snapshot_id)?,
            })
        })
        .await
    }

    pub async fn snapshot_processes(
        &self,
        snapshot_id: i64,
    ) -> Result<Vec<ProcessView>, StoreError> {
        self.run(move |conn| {
            snapshot_exists(conn, snapshot_id)?;
            processes_of_snapshot(conn, snapshot_id)
        })
        .await
    }

    pub async fn processes(
        &self,
        filter: ProcessFilter,
        page: PageRequest,
    ) -> Result<Page<ProcessView>, StoreError> {
        self.run(move |conn| {
            let (from, w) = process_scope(&filter);
            let count = w.count(conn, &from)?;
            let results = w.select(
                conn,
                &format!("SELECT {PROCESS_COLUMNS} {from}"),
                " ORDER BY p.cpu_percent DESC, p.memory_percent DESC, p.id ASC LIMIT ? OFFSET ?",
                &page_values(page),
                process_from_row,
            )?;
            Ok(Page { count, results })
        })
        .await
    }

    pub async fn system_metrics(
        &self,
        hostname: Option<String>,
        page: PageRequest,
    ) -> Result<Page<SystemMetricsView>, StoreError> {
        self.run(move |conn| {
            let mut w = Where::default();
            w.push_like("h.hostname LIKE ? ESCAPE '\\'", hostname.as_deref());
            let count = w.count(conn, METRICS_FROM)?;
            let rows = w.select(
                conn,
                &format!(
                    "SELECT s.id, s.host_id, h.hostname, s.captured_at_ms, {METRICS_COLUMNS} {METRICS_FROM}"
                ),
                " ORDER BY s.captured_at_ms DESC, s.id DESC LIMIT ? OFFSET ?",
                &page_values(page),
                metrics_view_from_row,
            )?;
            Ok(Page {
                count,
                results: into_metrics_views(rows)?,
            })
        })
        .await
    }

    pub async fn latest_system_metrics(&self) -> Result<Vec<SystemMetricsView>, StoreError> {
        self.run(|conn| {
            let sql = format!(
                "SELECT s.id, s.host_id, h.hostname, s.captured_at_ms, {METRICS_COLUMNS}
                 FROM hosts h
                 JOIN snapshots s ON s.id = {LATEST_SNAPSHOT_OF_H}
                 JOIN system_metrics m ON m.snapshot_id = s.id
                 WHERE h.is_active = 1
                 ORDER BY h.hostname"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], metrics_view_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            into_metrics_views(rows)
        })
        .await
    }

    pub async fn top_processes(
        &self,
        metric: TopMetric,
        limit: usize,
        hostname: Option<String>,
    ) -> Result<Vec<ProcessView>, StoreError> {
        self.run(move |conn| {
            let filter = ProcessFilter {
                hostname,
                ..ProcessFilter::default()
            };
            let (from, w) = process_scope(&filter);
            w.select(
                conn,
                &format!("SELECT {PROCESS_COLUMNS} {from}"),
                &format!(" ORDER BY {} DESC, p.id ASC LIMIT ?", metric.column()),
                &[Value::Integer(limit as i64)],
                process_from_row,
            )
        })
        .await
    }
}
