use crate::collectors::{Collection, HostIdentity, ProcessSource, RawProcess};
use crate::payload::{DiskUsage, NetworkIo, ProcessStatus, SystemMetrics};
#[cfg(target_os = "linux")]
use std::fs;
use std::net::UdpSocket;
use sysinfo::{
    CpuExt, DiskExt, NetworkExt, NetworksExt, PidExt, ProcessExt, ProcessStatus as OsStatus,
    System, SystemExt, UserExt,
};
use tracing::debug;

pub struct SysinfoSource {
    system: System,
    collect_system_metrics: bool,
}

impl SysinfoSource {
    pub fn new(collect_system_metrics: bool) -> Self {
        Self {
            system: System::new_all(),
            collect_system_metrics,
        }
    }
}

impl ProcessSource for SysinfoSource {
    fn collect(&mut self) -> Collection {
        let system = &mut self.system;
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_processes();
        system.refresh_users_list();
        if self.collect_system_metrics {
            system.refresh_disks_list();
            system.refresh_disks();
            system.refresh_networks_list();
            system.refresh_networks();
        }

        let identity = collect_identity(system);
        let processes = collect_processes(system, identity.total_memory);
        let metrics = if self.collect_system_metrics {
            collect_metrics(system)
        } else {
            SystemMetrics::default()
        };

        debug!(
            processes = processes.len(),
            hostname = %identity.hostname,
            "сбор процессов завершён"
        );
        Collection {
            identity,
            metrics,
            processes,
        }
    }
}

fn collect_identity(system: &System) -> HostIdentity {
    let name = system.name().unwrap_or_else(|| "Unknown".to_string());
    let kernel = system.kernel_version().unwrap_or_default();
    let os_info = format!("{name} {kernel}").trim().to_string();

    HostIdentity {
        hostname: system
            .host_name()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        ip_address: Some(primary_ip_address()),
        os_info,
        platform: platform_family(std::env::consts::OS),
        architecture: std::env::consts::ARCH.to_string(),
        cpu_count: system.cpus().len().max(1) as u32,
        total_memory: system.total_memory(),
    }
}

fn collect_processes(system: &System, total_memory: u64) -> Vec<RawProcess> {
    system
        .processes()
        .values()
        .map(|p| {
            let pid = p.pid().as_u32();
            let username = p
                .user_id()
                .and_then(|uid| system.get_user_by_id(uid))
                .map(|u| u.name().to_string());
            let exe = p.exe().to_string_lossy().to_string();
            let memory = p.memory();
            let memory_percent = if total_memory > 0 {
                Some((memory as f64 / total_memory as f64 * 100.0) as f32)
            } else {
                None
            };
            let (nice, threads) = read_proc_stat(pid);

            RawProcess {
                pid,
                parent: p.parent().map(|pp| pp.as_u32()),
                name: Some(p.name().to_string()).filter(|n| !n.is_empty()),
                exe: Some(exe).filter(|e| !e.is_empty()),
                cmd: p.cmd().to_vec(),
                status: Some(map_status(p.status())),
                username,
                cpu_usage: Some(p.cpu_usage()),
                memory: Some(memory),
                virtual_memory: Some(p.virtual_memory()),
                memory_percent,
                start_time: Some(p.start_time()).filter(|t| *t > 0),
                threads,
                nice,
            }
        })
        .collect()
}

fn collect_metrics(system: &System) -> SystemMetrics {
    let cpus = system.cpus();
    let cpu_percent = if cpus.is_empty() {
        None
    } else {
        let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
        Some((sum / cpus.len() as f32) as f64)
    };
    let freqs: Vec<u64> = cpus.iter().map(|c| c.frequency()).filter(|f| *f > 0).collect();
    let cpu_freq_current = if freqs.is_empty() {
        None
    } else {
        Some(freqs.iter().sum::<u64>() as f64 / freqs.len() as f64)
    };

    let total = system.total_memory();
    let used = system.used_memory();
    let memory_percent = if total > 0 {
        Some(used as f64 / total as f64 * 100.0)
    } else {
        None
    };

    let disk_usage = system
        .disks()
        .iter()
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            let used = total.saturating_sub(free);
            DiskUsage {
                device: d.name().to_string_lossy().to_string(),
                mountpoint: d.mount_point().to_string_lossy().to_string(),
                total,
                used,
                free,
                percent: if total > 0 {
                    used as f64 / total as f64 * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect();

    let mut net = NetworkIo::default();
    for (_iface, data) in system.networks().iter() {
        net.bytes_recv = net.bytes_recv.saturating_add(data.total_received());
        net.bytes_sent = net.bytes_sent.saturating_add(data.total_transmitted());
        net.packets_recv = net
            .packets_recv
            .saturating_add(data.total_packets_received());
        net.packets_sent = net
            .packets_sent
            .saturating_add(data.total_packets_transmitted());
    }

    SystemMetrics {
        cpu_percent,
        memory_percent,
        cpu_freq_current,
        cpu_freq_min: freqs.iter().min().map(|f| *f as f64),
        cpu_freq_max: freqs.iter().max().map(|f| *f as f64),
        memory_total: to_i64(total),
        memory_available: to_i64(system.available_memory()),
        memory_used: to_i64(used),
        memory_free: to_i64(system.free_memory()),
        disk_usage,
        network_io: Some(net),
    }
}

fn to_i64(v: u64) -> Option<i64> {
    i64::try_from(v).ok()
}

fn map_status(status: OsStatus) -> ProcessStatus {
    match status {
        OsStatus::Run => ProcessStatus::Running,
        OsStatus::Sleep | OsStatus::Idle => ProcessStatus::Sleeping,
        OsStatus::Stop | OsStatus::Tracing => ProcessStatus::Stopped,
        OsStatus::Zombie => ProcessStatus::Zombie,
        OsStatus::Dead => ProcessStatus::Dead,
        _ => ProcessStatus::Unknown,
    }
}

pub fn platform_family(os: &str) -> String {
    match os {
        "linux" | "android" => "Linux".to_string(),
        "windows" => "Windows".to_string(),
        "macos" => "Darwin".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Unknown".to_string(),
            }
        }
    }
}

fn primary_ip_address() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(target_os = "linux")]
fn read_proc_stat(pid: u32) -> (Option<i32>, Option<u32>) {
    let Ok(text) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return (None, None);
    };
    parse_proc_stat(&text)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat(_pid: u32) -> (Option<i32>, Option<u32>) {
    (None, None)
}

/// Returns `(nice, num_threads)` from a `/proc/<pid>/stat` line. The command
/// name is parenthesised and may itself contain spaces or parentheses.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(text: &str) -> (Option<i32>, Option<u32>) {
    let Some(close) = text.rfind(')') else {
        return (None, None);
    };
    let rest: Vec<&str> = text[close + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state); nice is field 19, num_threads field 20.
    let nice = rest.get(16).and_then(|v| v.parse::<i32>().ok());
    let threads = rest.get(17).and_then(|v| v.parse::<u32>().ok());
    (nice, threads)
}
