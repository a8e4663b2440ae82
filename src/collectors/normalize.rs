use crate::collectors::RawProcess;
use crate::payload::{ProcessRecord, ProcessStatus};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub excluded_names: Vec<String>,
    pub max_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub excluded: usize,
    pub duplicates: usize,
    pub truncated: usize,
}

pub fn normalize(
    raw: Vec<RawProcess>,
    opts: &NormalizeOptions,
) -> (Vec<ProcessRecord>, NormalizeStats) {
    let mut stats = NormalizeStats::default();
    let mut seen = HashSet::with_capacity(raw.len());
    let mut out = Vec::with_capacity(raw.len().min(opts.max_records));

    for proc in raw {
        // The first occurrence wins even when it is excluded, so a later
        // duplicate cannot sneak a filtered process back in.
        if !seen.insert(proc.pid) {
            stats.duplicates += 1;
            continue;
        }
        let name = proc.name.clone().unwrap_or_default();
        if is_excluded(&name, &opts.excluded_names) {
            stats.excluded += 1;
            continue;
        }
        out.push(to_record(proc, name));
    }

    out.sort_by_key(|p| p.pid);
    if out.len() > opts.max_records {
        stats.truncated = out.len() - opts.max_records;
        out.truncate(opts.max_records);
    }

    debug!(
        kept = out.len(),
        excluded = stats.excluded,
        duplicates = stats.duplicates,
        truncated = stats.truncated,
        "нормализация списка процессов"
    );
    (out, stats)
}

pub fn is_excluded(name: &str, patterns: &[String]) -> bool {
    if name.is_empty() || patterns.is_empty() {
        return false;
    }
    let lower = name.to_lowercase();
    patterns.iter().any(|p| lower.contains(p.as_str()))
}

fn to_record(proc: RawProcess, name: String) -> ProcessRecord {
    let cmdline = if proc.cmd.is_empty() {
        None
    } else {
        Some(proc.cmd.join(" "))
    };
    ProcessRecord {
        pid: i64::from(proc.pid),
        ppid: proc.parent.map(i64::from),
        name,
        exe: proc.exe.filter(|e| !e.is_empty()),
        cmdline,
        status: proc.status.unwrap_or(ProcessStatus::Unknown),
        username: proc.username.unwrap_or_default(),
        cpu_percent: proc
            .cpu_usage
            .map(f64::from)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0),
        memory_rss: clamp_bytes(proc.memory),
        memory_vms: clamp_bytes(proc.virtual_memory),
        memory_percent: proc
            .memory_percent
            .map(f64::from)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0),
        create_time: proc.start_time.filter(|t| *t > 0).map(|t| t as f64),
        num_threads: proc.threads.filter(|t| *t > 0).map(i64::from),
        nice: proc.nice.map(i64::from),
    }
}

fn clamp_bytes(v: Option<u64>) -> i64 {
    v.map(|b| i64::try_from(b).unwrap_or(i64::MAX)).unwrap_or(0)
}
