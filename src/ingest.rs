use crate::payload::{FieldError, ProcessRecord, Submission, SystemMetrics};
use subtle::ConstantTimeEq;

const MAX_HOSTNAME_LEN: usize = 255;
const MAX_NAME_LEN: usize = 255;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_processes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotTotals {
    pub total_processes: i64,
    pub total_cpu_percent: f64,
    pub total_memory_mb: f64,
    pub system_cpu_percent: f64,
    pub system_memory_percent: f64,
}

pub fn check_api_key(expected: &str, presented: Option<&str>) -> bool {
    let presented = presented.unwrap_or("");
    if expected.is_empty() {
        return false;
    }
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

pub fn validate_submission(sub: &Submission, limits: Limits) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    let hostname_len = sub.hostname.trim().chars().count();
    if hostname_len == 0 {
        errors.push(FieldError::new("hostname", "обязательное поле"));
    } else if sub.hostname.chars().count() > MAX_HOSTNAME_LEN {
        errors.push(FieldError::new(
            "hostname",
            format!("длина не должна превышать {MAX_HOSTNAME_LEN} символов"),
        ));
    }
    if let Some(cpu_count) = sub.cpu_count {
        if cpu_count < 1 {
            errors.push(FieldError::new("cpu_count", "должно быть >= 1"));
        }
    }
    if let Some(total_memory) = sub.total_memory {
        if total_memory < 0 {
            errors.push(FieldError::new("total_memory", "должно быть >= 0"));
        }
    }
    if sub.processes.len() > limits.max_processes {
        errors.push(FieldError::new(
            "processes",
            format!(
                "слишком много процессов: {} (максимум {})",
                sub.processes.len(),
                limits.max_processes
            ),
        ));
    } else {
        for (i, p) in sub.processes.iter().enumerate() {
            validate_process(i, p, &mut errors);
        }
    }
    validate_system_metrics(&sub.system_metrics, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_process(i: usize, p: &ProcessRecord, errors: &mut Vec<FieldError>) {
    let field = |name: &str| format!("processes[{i}].{name}");

    if p.pid < 0 {
        errors.push(FieldError::new(field("pid"), "должно быть >= 0"));
    }
    if matches!(p.ppid, Some(v) if v < 0) {
        errors.push(FieldError::new(field("ppid"), "должно быть >= 0 или null"));
    }
    if p.name.chars().count() > MAX_NAME_LEN {
        errors.push(FieldError::new(
            field("name"),
            format!("длина не должна превышать {MAX_NAME_LEN} символов"),
        ));
    }
    if !non_negative(p.cpu_percent) {
        errors.push(FieldError::new(field("cpu_percent"), "должно быть числом >= 0"));
    }
    if !non_negative(p.memory_percent) {
        errors.push(FieldError::new(
            field("memory_percent"),
            "должно быть числом >= 0",
        ));
    }
    if p.memory_rss < 0 {
        errors.push(FieldError::new(field("memory_rss"), "должно быть >= 0"));
    }
    if p.memory_vms < 0 {
        errors.push(FieldError::new(field("memory_vms"), "должно быть >= 0"));
    }
    if matches!(p.create_time, Some(t) if !non_negative(t)) {
        errors.push(FieldError::new(
            field("create_time"),
            "должно быть временем эпохи >= 0",
        ));
    }
    if matches!(p.num_threads, Some(t) if t < 1) {
        errors.push(FieldError::new(field("num_threads"), "должно быть >= 1"));
    }
}

fn validate_system_metrics(m: &SystemMetrics, errors: &mut Vec<FieldError>) {
    let percent = |name: &str, v: Option<f64>, errors: &mut Vec<FieldError>| {
        if let Some(v) = v {
            if !(v.is_finite() && (0.0..=100.0).contains(&v)) {
                errors.push(FieldError::new(
                    format!("system_metrics.{name}"),
                    "должно быть в диапазоне 0..100",
                ));
            }
        }
    };
    percent("cpu_percent", m.cpu_percent, errors);
    percent("memory_percent", m.memory_percent, errors);

    for (name, v) in [
        ("memory_total", m.memory_total),
        ("memory_available", m.memory_available),
        ("memory_used", m.memory_used),
        ("memory_free", m.memory_free),
    ] {
        if matches!(v, Some(v) if v < 0) {
            errors.push(FieldError::new(
                format!("system_metrics.{name}"),
                "должно быть >= 0",
            ));
        }
    }
    for (name, v) in [
        ("cpu_freq_current", m.cpu_freq_current),
        ("cpu_freq_min", m.cpu_freq_min),
        ("cpu_freq_max", m.cpu_freq_max),
    ] {
        if matches!(v, Some(v) if !non_negative(v)) {
            errors.push(FieldError::new(
                format!("system_metrics.{name}"),
                "должно быть числом >= 0",
            ));
        }
    }
}

fn non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

pub fn snapshot_totals(sub: &Submission) -> SnapshotTotals {
    let total_cpu_percent = sub.processes.iter().map(|p| p.cpu_percent).sum();
    let total_rss: i64 = sub
        .processes
        .iter()
        .fold(0_i64, |acc, p| acc.saturating_add(p.memory_rss));
    SnapshotTotals {
        total_processes: sub.processes.len() as i64,
        total_cpu_percent,
        total_memory_mb: total_rss as f64 / BYTES_PER_MB,
        system_cpu_percent: sub.system_metrics.cpu_percent.unwrap_or(0.0),
        system_memory_percent: sub.system_metrics.memory_percent.unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(processes: Vec<ProcessRecord>) -> Submission {
        Submission {
            hostname: "h1".to_string(),
            ip_address: None,
            os_info: None,
            platform: None,
            architecture: None,
            cpu_count: Some(4),
            total_memory: Some(8 << 30),
            processes,
            system_metrics: SystemMetrics::default(),
        }
    }

    fn process(pid: i64, ppid: Option<i64>) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            name: format!("p{pid}"),
            exe: None,
            cmdline: None,
            status: Default::default(),
            username: String::new(),
            cpu_percent: 1.5,
            memory_rss: 1024 * 1024,
            memory_vms: 0,
            memory_percent: 0.0,
            create_time: None,
            num_threads: None,
            nice: None,
        }
    }

    const LIMITS: Limits = Limits { max_processes: 10 };

    #[test]
    fn api_key_comparison() {
        assert!(check_api_key("secret", Some("secret")));
        assert!(!check_api_key("secret", Some("secreT")));
        assert!(!check_api_key("secret", Some("secret-longer")));
        assert!(!check_api_key("secret", None));
        assert!(!check_api_key("", Some("")));
    }

    #[test]
    fn empty_process_list_is_accepted() {
        assert!(validate_submission(&submission(vec![]), LIMITS).is_ok());
    }

    #[test]
    fn negative_pid_is_reported_with_index() {
        let sub = submission(vec![process(1, None), process(-3, Some(1))]);
        let errors = validate_submission(&sub, LIMITS).expect_err("отрицательный pid");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "processes[1].pid");
    }

    #[test]
    fn blank_hostname_and_oversized_list_are_rejected() {
        let mut sub = submission((0..11).map(|pid| process(pid, None)).collect());
        sub.hostname = "   ".to_string();
        let errors = validate_submission(&sub, LIMITS).expect_err("невалидная заявка");
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["hostname", "processes"]);
    }

    #[test]
    fn cpu_above_hundred_is_allowed_but_nan_is_not() {
        let mut busy = process(1, None);
        busy.cpu_percent = 740.0;
        assert!(validate_submission(&submission(vec![busy]), LIMITS).is_ok());

        let mut broken = process(2, None);
        broken.cpu_percent = f64::NAN;
        assert!(validate_submission(&submission(vec![broken]), LIMITS).is_err());
    }

    #[test]
    fn system_percent_over_hundred_is_rejected() {
        let mut sub = submission(vec![]);
        sub.system_metrics.memory_percent = Some(101.0);
        let errors = validate_submission(&sub, LIMITS).expect_err("процент вне диапазона");
        assert_eq!(errors[0].field, "system_metrics.memory_percent");
    }

    #[test]
    fn totals_sum_cpu_and_rss() {
        let mut sub = submission(vec![process(1, None), process(2, Some(1))]);
        sub.system_metrics.cpu_percent = Some(12.5);
        let totals = snapshot_totals(&sub);
        assert_eq!(totals.total_processes, 2);
        assert!((totals.total_cpu_percent - 3.0).abs() < 1e-9);
        assert!((totals.total_memory_mb - 2.0).abs() < 1e-9);
        assert_eq!(totals.system_cpu_percent, 12.5);
        assert_eq!(totals.system_memory_percent, 0.0);
    }
}
