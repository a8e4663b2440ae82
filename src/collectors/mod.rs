pub mod normalize;
pub mod system;

use crate::payload::{ProcessStatus, SystemMetrics};

#[derive(Debug, Clone, Default)]
pub struct RawProcess {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub exe: Option<String>,
    pub cmd: Vec<String>,
    pub status: Option<ProcessStatus>,
    pub username: Option<String>,
    pub cpu_usage: Option<f32>,
    pub memory: Option<u64>,
    pub virtual_memory: Option<u64>,
    pub memory_percent: Option<f32>,
    pub start_time: Option<u64>,
    pub threads: Option<u32>,
    pub nice: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct HostIdentity {
    pub hostname: String,
    pub ip_address: Option<String>,
    pub os_info: String,
    pub platform: String,
    pub architecture: String,
    pub cpu_count: u32,
    pub total_memory: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub identity: HostIdentity,
    pub metrics: SystemMetrics,
    pub processes: Vec<RawProcess>,
}

pub trait ProcessSource {
    fn collect(&mut self) -> Collection;
}
