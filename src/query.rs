use crate::payload::{FieldError, ProcessStatus};
use crate::storage::{parse_rfc3339_ms, Page};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    Lenient,
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub platform: Option<String>,
    pub is_active: Option<bool>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub hostname: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub name: Option<String>,
    pub status: Option<ProcessStatus>,
    pub username: Option<String>,
    pub min_cpu: Option<f64>,
    pub max_cpu: Option<f64>,
    pub min_memory: Option<i64>,
    pub max_memory: Option<i64>,
    pub hostname: Option<String>,
    pub snapshot: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub platform: Option<String>,
    pub is_active: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub hostname: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PagingParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostnameParams {
    pub hostname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TopParams {
    pub limit: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub name: Option<String>,
    pub process_name: Option<String>,
    pub status: Option<String>,
    pub username: Option<String>,
    pub min_cpu: Option<String>,
    pub max_cpu: Option<String>,
    pub min_memory: Option<String>,
    pub max_memory: Option<String>,
    pub hostname: Option<String>,
    pub snapshot: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub count: i64,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub results: Vec<T>,
}

impl<T> Envelope<T> {
    /// `next`/`previous` repeat the caller's query string with only
    /// `limit` and `offset` replaced.
    pub fn new(path: &str, raw_query: Option<&str>, page: PageRequest, rows: Page<T>) -> Self {
        let end = page.offset.saturating_add(page.limit);
        let next = if (end as i64) < rows.count {
            Some(page_link(path, raw_query, page.limit, end))
        } else {
            None
        };
        let previous = if page.offset > 0 {
            Some(page_link(
                path,
                raw_query,
                page.limit,
                page.offset.saturating_sub(page.limit),
            ))
        } else {
            None
        };
        Self {
            count: rows.count,
            next,
            previous,
            results: rows.results,
        }
    }
}

fn page_link(path: &str, raw_query: Option<&str>, limit: usize, offset: usize) -> String {
    let mut pairs: Vec<String> = raw_query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            key != "limit" && key != "offset"
        })
        .map(str::to_string)
        .collect();
    pairs.push(format!("limit={limit}"));
    if offset > 0 {
        pairs.push(format!("offset={offset}"));
    }
    format!("{path}?{}", pairs.join("&"))
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_field<T: FromStr>(
    field: &str,
    raw: &Option<String>,
    errors: &mut Vec<FieldError>,
) -> Option<T> {
    let text = present(raw)?;
    match text.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(FieldError::new(field, format!("некорректное значение '{text}'")));
            None
        }
    }
}

fn finish<T>(value: T, errors: Vec<FieldError>) -> Result<T, Vec<FieldError>> {
    if errors.is_empty() {
        Ok(value)
    } else {
        Err(errors)
    }
}

pub fn page_request(
    limit: &Option<String>,
    offset: &Option<String>,
    limits: PageLimits,
    mode: Strictness,
) -> Result<PageRequest, Vec<FieldError>> {
    match mode {
        Strictness::Lenient => {
            let limit = present(limit)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v > 0)
                .map(|v| (v as u64).min(limits.max_limit as u64) as usize)
                .unwrap_or(limits.default_limit);
            let offset = present(offset)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| *v >= 0)
                .map(|v| v as usize)
                .unwrap_or(0);
            Ok(PageRequest { limit, offset })
        }
        Strictness::Strict => {
            let mut errors = Vec::new();
            let parsed_limit = parse_field::<i64>("limit", limit, &mut errors);
            let parsed_offset = parse_field::<i64>("offset", offset, &mut errors);
            let limit = match parsed_limit {
                Some(v) if v < 1 || v > limits.max_limit as i64 => {
                    errors.push(FieldError::new(
                        "limit",
                        format!("должно быть в диапазоне 1..{}", limits.max_limit),
                    ));
                    limits.default_limit
                }
                Some(v) => v as usize,
                None => limits.default_limit,
            };
            let offset = match parsed_offset {
                Some(v) if v < 0 => {
                    errors.push(FieldError::new("offset", "должно быть >= 0"));
                    0
                }
                Some(v) => v as usize,
                None => 0,
            };
            finish(PageRequest { limit, offset }, errors)
        }
    }
}

pub fn top_limit(limit: &Option<String>, default: usize, max: usize) -> usize {
    present(limit)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| (v as u64).min(max as u64) as usize)
        .unwrap_or(default)
}

pub fn parse_host_filter(params: &HostParams) -> Result<HostFilter, Vec<FieldError>> {
    let mut errors = Vec::new();
    let is_active = match present(&params.is_active).map(str::to_ascii_lowercase) {
        None => None,
        Some(v) if v == "true" || v == "1" => Some(true),
        Some(v) if v == "false" || v == "0" => Some(false),
        Some(v) => {
            errors.push(FieldError::new(
                "is_active",
                format!("ожидалось true или false, получено '{v}'"),
            ));
            None
        }
    };
    let filter = HostFilter {
        platform: present(&params.platform).map(str::to_string),
        is_active,
        hostname: present(&params.hostname).map(str::to_string),
    };
    finish(filter, errors)
}

pub fn parse_snapshot_filter(params: &SnapshotParams) -> Result<SnapshotFilter, Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut time = |field: &str, raw: &Option<String>| -> Option<i64> {
        let text = present(raw)?;
        let parsed = parse_rfc3339_ms(text);
        if parsed.is_none() {
            errors.push(FieldError::new(
                field,
                format!("ожидалось время RFC 3339, получено '{text}'"),
            ));
        }
        parsed
    };
    let start_ms = time("start", &params.start);
    let end_ms = time("end", &params.end);
    let filter = SnapshotFilter {
        hostname: present(&params.hostname).map(str::to_string),
        start_ms,
        end_ms,
    };
    finish(filter, errors)
}

pub fn parse_process_filter(
    params: &ProcessParams,
    mode: Strictness,
) -> Result<ProcessFilter, Vec<FieldError>> {
    let mut errors = Vec::new();
    let status = present(&params.status).and_then(|s| match s.parse::<ProcessStatus>() {
        Ok(v) => Some(v),
        Err(msg) => {
            errors.push(FieldError::new("status", msg));
            None
        }
    });
    let filter = ProcessFilter {
        name: present(&params.name)
            .or_else(|| present(&params.process_name))
            .map(str::to_string),
        status,
        username: present(&params.username).map(str::to_string),
        min_cpu: parse_field("min_cpu", &params.min_cpu, &mut errors),
        max_cpu: parse_field("max_cpu", &params.max_cpu, &mut errors),
        min_memory: parse_field("min_memory", &params.min_memory, &mut errors),
        max_memory: parse_field("max_memory", &params.max_memory, &mut errors),
        hostname: present(&params.hostname).map(str::to_string),
        snapshot: parse_field("snapshot", &params.snapshot, &mut errors),
    };

    if mode == Strictness::Strict {
        check_range("cpu", filter.min_cpu, filter.max_cpu, &mut errors);
        check_range(
            "memory",
            filter.min_memory.map(|v| v as f64),
            filter.max_memory.map(|v| v as f64),
            &mut errors,
        );
    }
    finish(filter, errors)
}

fn check_range(what: &str, min: Option<f64>, max: Option<f64>, errors: &mut Vec<FieldError>) {
    for (field, v) in [(format!("min_{what}"), min), (format!("max_{what}"), max)] {
        if matches!(v, Some(v) if !(v.is_finite() && v >= 0.0)) {
            errors.push(FieldError::new(field, "должно быть >= 0"));
        }
    }
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > hi {
            errors.push(FieldError::new(
                format!("min_{what}"),
                format!("min_{what} не может превышать max_{what}"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PageLimits = PageLimits {
        default_limit: 100,
        max_limit: 1000,
    };

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn lenient_paging_clamps_and_defaults() {
        let page = page_request(&s("10000"), &s("20"), LIMITS, Strictness::Lenient)
            .expect("мягкий режим не отклоняет");
        assert_eq!(page, PageRequest { limit: 1000, offset: 20 });

        let page = page_request(&s("-5"), &s("abc"), LIMITS, Strictness::Lenient)
            .expect("мягкий режим не отклоняет");
        assert_eq!(page, PageRequest { limit: 100, offset: 0 });

        for huge in ["9223372036854775808", "18446744073709551615", "-3"] {
            let page = page_request(&None, &s(huge), LIMITS, Strictness::Lenient)
                .expect("мягкий режим не отклоняет");
            assert_eq!(page.offset, 0, "offset {huge}");
        }
    }

    #[test]
    fn strict_paging_rejects_out_of_range() {
        for bad in ["0", "1001", "ten"] {
            let errors = page_request(&s(bad), &None, LIMITS, Strictness::Strict)
                .expect_err("строгий режим отклоняет");
            assert_eq!(errors[0].field, "limit");
        }
        assert!(page_request(&s("1000"), &s("5"), LIMITS, Strictness::Strict).is_ok());
    }

    #[test]
    fn strict_search_checks_ranges_and_accepts_alias() {
        let params = ProcessParams {
            process_name: s("nginx"),
            min_cpu: s("50"),
            max_cpu: s("10"),
            min_memory: s("-1"),
            ..ProcessParams::default()
        };
        let errors = parse_process_filter(&params, Strictness::Strict).expect_err("диапазоны");
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["min_cpu", "min_memory"]);

        let lenient = parse_process_filter(&params, Strictness::Lenient).expect("мягкий режим");
        assert_eq!(lenient.name.as_deref(), Some("nginx"));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let params = ProcessParams {
            status: s("disk-sleep"),
            ..ProcessParams::default()
        };
        assert!(parse_process_filter(&params, Strictness::Lenient).is_err());
    }

    #[test]
    fn envelope_links_keep_filters() {
        let rows = Page {
            count: 25,
            results: vec![1, 2, 3, 4, 5],
        };
        let env = Envelope::new(
            "/api/v1/processes",
            Some("name=sh&limit=5&offset=10"),
            PageRequest { limit: 5, offset: 10 },
            rows,
        );
        assert_eq!(env.next.as_deref(), Some("/api/v1/processes?name=sh&limit=5&offset=15"));
        assert_eq!(env.previous.as_deref(), Some("/api/v1/processes?name=sh&limit=5&offset=5"));

        let last = Envelope::new(
            "/api/v1/hosts",
            None,
            PageRequest { limit: 10, offset: 0 },
            Page {
                count: 3,
                results: vec!["a", "b", "c"],
            },
        );
        assert!(last.next.is_none());
        assert!(last.previous.is_none());
    }

    #[test]
    fn host_filter_parses_booleans() {
        let params = HostParams {
            is_active: s("TRUE"),
            ..HostParams::default()
        };
        assert_eq!(parse_host_filter(&params).expect("фильтр").is_active, Some(true));
        let params = HostParams {
            is_active: s("maybe"),
            ..HostParams::default()
        };
        assert!(parse_host_filter(&params).is_err());
    }

    #[test]
    fn snapshot_window_needs_rfc3339() {
        let params = SnapshotParams {
            start: s("2024-05-01T00:00:00Z"),
            end: s("tomorrow"),
            ..SnapshotParams::default()
        };
        let errors = parse_snapshot_filter(&params).expect_err("некорректный end");
        assert_eq!(errors[0].field, "end");
    }
}
