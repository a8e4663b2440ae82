use super::{now_ms, Store, StoreError};
use crate::ingest::SnapshotTotals;
use crate::payload::Submission;
use rusqlite::{params, Connection, TransactionBehavior};

#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub snapshot_id: i64,
    pub host_id: i64,
    pub hostname: String,
    pub captured_at_ms: i64,
    pub processes_count: usize,
    pub active_hosts: i64,
}

impl Store {
    pub async fn ingest(
        &self,
        sub: Submission,
        totals: SnapshotTotals,
    ) -> Result<IngestReceipt, StoreError> {
        self.run(move |conn| ingest_blocking(conn, &sub, &totals))
            .await
    }
}

fn ingest_blocking(
    conn: &mut Connection,
    sub: &Submission,
    totals: &SnapshotTotals,
) -> Result<IngestReceipt, StoreError> {
    let now = now_ms();
    let hostname = sub.hostname.trim();
    // IMMEDIATE takes the write lock up front so two submissions for the
    // same hostname cannot interleave their upserts.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let host_id: i64 = tx.query_row(
        "INSERT INTO hosts (hostname, ip_address, os_info, platform, architecture,
                            cpu_count, total_memory, is_active, first_seen_ms, last_seen_ms)
         VALUES (?1, ?2, COALESCE(?3, ''), COALESCE(?4, 'Unknown'), COALESCE(?5, 'Unknown'),
                 COALESCE(?6, 1), COALESCE(?7, 0), 1, ?8, ?8)
         ON CONFLICT (hostname) DO UPDATE SET
             ip_address   = COALESCE(?2, ip_address),
             os_info      = COALESCE(?3, os_info),
             platform     = COALESCE(?4, platform),
             architecture = COALESCE(?5, architecture),
             cpu_count    = COALESCE(?6, cpu_count),
             total_memory = COALESCE(?7, total_memory),
             is_active    = 1,
             last_seen_ms = ?8
         RETURNING id",
        params![
            hostname,
            sub.ip_address,
            sub.os_info,
            sub.platform,
            sub.architecture,
            sub.cpu_count,
            sub.total_memory,
            now,
        ],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO snapshots (host_id, captured_at_ms, total_processes, total_cpu_percent,
                                total_memory_mb, system_cpu_percent, system_memory_percent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            host_id,
            now,
            totals.total_processes,
            totals.total_cpu_percent,
            totals.total_memory_mb,
            totals.system_cpu_percent,
            totals.system_memory_percent,
        ],
    )?;
    let snapshot_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO processes (snapshot_id, pid, ppid, name, exe, cmdline, status, username,
                                    cpu_percent, memory_rss, memory_vms, memory_percent,
                                    create_time, num_threads, nice)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )?;
        for p in &sub.processes {
            stmt.execute(params![
                snapshot_id,
                p.pid,
                p.ppid,
                p.name,
                p.exe,
                p.cmdline,
                p.status.as_str(),
                p.username,
                p.cpu_percent,
                p.memory_rss,
                p.memory_vms,
                p.memory_percent,
                p.create_time,
                p.num_threads,
                p.nice,
            ])?;
        }
    }

    let m = &sub.system_metrics;
    let disk_usage_json = serde_json::to_string(&m.disk_usage)?;
    let network_io_json = m.network_io.as_ref().map(serde_json::to_string).transpose()?;
    tx.execute(
        "INSERT INTO system_metrics (snapshot_id, cpu_percent, memory_percent, cpu_freq_current,
                                     cpu_freq_min, cpu_freq_max, memory_total, memory_available,
                                     memory_used, memory_free, disk_usage_json, network_io_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            snapshot_id,
            m.cpu_percent,
            m.memory_percent,
            m.cpu_freq_current,
            m.cpu_freq_min,
            m.cpu_freq_max,
            m.memory_total,
            m.memory_available,
            m.memory_used,
            m.memory_free,
            disk_usage_json,
            network_io_json,
        ],
    )?;

    let active_hosts: i64 =
        tx.query_row("SELECT COUNT(*) FROM hosts WHERE is_active = 1", [], |r| r.get(0))?;

    tx.commit()?;
    Ok(IngestReceipt {
        snapshot_id,
        host_id,
        hostname: hostname.to_string(),
        captured_at_ms: now,
        processes_count: sub.processes.len(),
        active_hosts,
    })
}
