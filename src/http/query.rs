use super::{ApiError, HttpAppState};
use crate::query::{
    page_request, parse_host_filter, parse_process_filter, parse_snapshot_filter, top_limit,
    Envelope, HostParams, HostnameParams, MetricsParams, PagingParams, ProcessFilter,
    ProcessParams, SnapshotParams, Strictness, TopParams,
};
use crate::storage::{
    HostSummary, HostView, ProcessView, SnapshotDetail, SnapshotView, SystemMetricsView,
    TopMetric,
};
use crate::tree::{build_forest, TreeNode};
use axum::extract::{Path, Query, State};
use axum::http::Uri;
use axum::Json;
use serde::Serialize;
use tracing::{debug, warn};

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub(super) struct TreeResponse {
    snapshot_id: i64,
    process_count: usize,
    roots: Vec<TreeNode<ProcessView>>,
    duplicate_pids: Vec<i64>,
    cycle_breaks: Vec<i64>,
}

pub(super) async fn list_hosts(
    State(state): State<HttpAppState>,
    Query(params): Query<HostParams>,
    uri: Uri,
) -> ApiResult<Envelope<HostView>> {
    let page = page_request(
        &params.limit,
        &params.offset,
        state.settings.page,
        Strictness::Lenient,
    )?;
    let filter = parse_host_filter(&params)?;
    let rows = state.store.hosts(filter, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

pub(super) async fn host_summary(
    State(state): State<HttpAppState>,
) -> ApiResult<Vec<HostSummary>> {
    Ok(Json(state.store.host_summaries().await?))
}

pub(super) async fn host_detail(
    State(state): State<HttpAppState>,
    Path(host_id): Path<i64>,
) -> ApiResult<HostView> {
    Ok(Json(state.store.host(host_id).await?))
}

pub(super) async fn host_snapshots(
    State(state): State<HttpAppState>,
    Path(host_id): Path<i64>,
    Query(params): Query<PagingParams>,
    uri: Uri,
) -> ApiResult<Envelope<SnapshotView>> {
    let page = page_request(
        &params.limit,
        &params.offset,
        state.settings.page,
        Strictness::Lenient,
    )?;
    let rows = state.store.host_snapshots(host_id, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

pub(super) async fn host_processes(
    State(state): State<HttpAppState>,
    Path(host_id): Path<i64>,
    Query(params): Query<PagingParams>,
    uri: Uri,
) -> ApiResult<Envelope<ProcessView>> {
    let page = page_request(
        &params.limit,
        &params.offset,
        state.settings.page,
        Strictness::Lenient,
    )?;
    let snapshot_id = state.store.host_latest_snapshot_id(host_id).await?;
    let filter = ProcessFilter {
        snapshot: Some(snapshot_id),
        ..ProcessFilter::default()
    };
    let rows = state.store.processes(filter, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

pub(super) async fn host_tree(
    State(state): State<HttpAppState>,
    Path(host_id): Path<i64>,
) -> ApiResult<TreeResponse> {
    let snapshot_id = state.store.host_latest_snapshot_id(host_id).await?;
    tree_of(&state, snapshot_id).await
}

pub(super) async fn list_snapshots(
    State(state): State<HttpAppState>,
    Query(params): Query<SnapshotParams>,
    uri: Uri,
) -> ApiResult<Envelope<SnapshotView>> {
    let page = page_request(
        &params.limit,
        &params.offset,
        state.settings.page,
        Strictness::Lenient,
    )?;
    let filter = parse_snapshot_filter(&params)?;
    let rows = state.store.snapshots(filter, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

pub(super) async fn latest_snapshots(
    State(state): State<HttpAppState>,
    Query(params): Query<HostnameParams>,
) -> ApiResult<Vec<SnapshotView>> {
    let hostname = params
        .hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    Ok(Json(state.store.latest_snapshots(hostname).await?))
}

pub(super) async fn snapshot_detail(
    State(state): State<HttpAppState>,
    Path(snapshot_id): Path<i64>,
) -> ApiResult<SnapshotDetail> {
    Ok(Json(state.store.snapshot(snapshot_id).await?))
}

pub(super) async fn snapshot_tree(
    State(state): State<HttpAppState>,
    Path(snapshot_id): Path<i64>,
) -> ApiResult<TreeResponse> {
    tree_of(&state, snapshot_id).await
}

pub(super) async fn list_processes(
    State(state): State<HttpAppState>,
    Query(params): Query<ProcessParams>,
    uri: Uri,
) -> ApiResult<Envelope<ProcessView>> {
    search(state, params, uri, Strictness::Lenient).await
}

pub(super) async fn search_processes(
    State(state): State<HttpAppState>,
    Query(params): Query<ProcessParams>,
    uri: Uri,
) -> ApiResult<Envelope<ProcessView>> {
    search(state, params, uri, Strictness::Strict).await
}

pub(super) async fn top_cpu(
    State(state): State<HttpAppState>,
    Query(params): Query<TopParams>,
) -> ApiResult<Vec<ProcessView>> {
    top(state, params, TopMetric::Cpu).await
}

pub(super) async fn top_memory(
    State(state): State<HttpAppState>,
    Query(params): Query<TopParams>,
) -> ApiResult<Vec<ProcessView>> {
    top(state, params, TopMetric::Memory).await
}

pub(super) async fn list_system_metrics(
    State(state): State<HttpAppState>,
    Query(params): Query<MetricsParams>,
    uri: Uri,
) -> ApiResult<Envelope<SystemMetricsView>> {
    let page = page_request(
        &params.limit,
        &params.offset,
        state.settings.page,
        Strictness::Lenient,
    )?;
    let hostname = params
        .hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    let rows = state.store.system_metrics(hostname, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

pub(super) async fn latest_system_metrics(
    State(state): State<HttpAppState>,
) -> ApiResult<Vec<SystemMetricsView>> {
    Ok(Json(state.store.latest_system_metrics().await?))
}

async fn search(
    state: HttpAppState,
    params: ProcessParams,
    uri: Uri,
    mode: Strictness,
) -> ApiResult<Envelope<ProcessView>> {
    let page = page_request(&params.limit, &params.offset, state.settings.page, mode)?;
    let filter = parse_process_filter(&params, mode)?;
    let rows = state.store.processes(filter, page).await?;
    Ok(Json(Envelope::new(uri.path(), uri.query(), page, rows)))
}

async fn top(
    state: HttpAppState,
    params: TopParams,
    metric: TopMetric,
) -> ApiResult<Vec<ProcessView>> {
    let limit = top_limit(
        &params.limit,
        state.settings.default_top_n,
        state.settings.max_top_n,
    );
    let hostname = params
        .hostname
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    Ok(Json(state.store.top_processes(metric, limit, hostname).await?))
}

async fn tree_of(state: &HttpAppState, snapshot_id: i64) -> ApiResult<TreeResponse> {
    let rows = state.store.snapshot_processes(snapshot_id).await?;
    let process_count = rows.len();
    let forest = build_forest(rows);

    if forest.report.is_clean() {
        debug!(
            snapshot_id,
            nodes = forest.node_count(),
            roots = forest.roots.len(),
            "дерево процессов построено"
        );
    } else {
        warn!(
            snapshot_id,
            duplicate_pids = ?forest.report.duplicate_pids,
            cycle_breaks = ?forest.report.cycle_breaks,
            "нарушенные связи родитель/потомок в снимке"
        );
        state.metrics.record_tree_report(&forest.report);
    }

    Ok(Json(TreeResponse {
        snapshot_id,
        process_count,
        roots: forest.roots,
        duplicate_pids: forest.report.duplicate_pids,
        cycle_breaks: forest.report.cycle_breaks,
    }))
}
