use crate::collectors::normalize::{normalize, NormalizeOptions};
use crate::collectors::{Collection, HostIdentity, ProcessSource};
use crate::config::AgentConfig;
use crate::payload::{ProcessRecord, Submission, SystemMetrics};
use crate::state::{AgentState, CycleOutcome};
use crate::submitter::{SubmitError, Submitter};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            retries: cfg.retry_attempts,
            base_delay: Duration::from_millis(cfg.retry_delay_ms),
            max_delay: Duration::from_millis(cfg.max_retry_delay_ms),
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    AuthRejected,
}

pub struct Agent<S> {
    source: S,
    submitter: Submitter,
    normalize: NormalizeOptions,
    retry: RetryPolicy,
}

impl<S: ProcessSource> Agent<S> {
    pub fn new(source: S, submitter: Submitter, cfg: &AgentConfig) -> Self {
        Self {
            source,
            submitter,
            normalize: NormalizeOptions {
                excluded_names: cfg.normalized_excluded_names(),
                max_records: cfg.max_processes,
            },
            retry: RetryPolicy::from_config(cfg),
        }
    }

    pub async fn run_until<F>(
        &mut self,
        state: &mut AgentState,
        period: Duration,
        shutdown: F,
    ) -> LoopExit
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return LoopExit::Shutdown,
                _ = ticker.tick() => {
                    // A cycle stuck in backoff must not hold up shutdown.
                    tokio::select! {
                        _ = &mut shutdown => return LoopExit::Shutdown,
                        outcome = self.run_cycle(state) => {
                            if outcome == CycleOutcome::AuthRejected {
                                return LoopExit::AuthRejected;
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn run_cycle(&mut self, state: &mut AgentState) -> CycleOutcome {
        let Collection {
            identity,
            metrics,
            processes: raw,
        } = self.source.collect();
        let raw_count = raw.len();
        let hostname = identity.hostname.clone();
        let (processes, stats) = normalize(raw, &self.normalize);

        let outcome = if processes.is_empty() {
            warn!(hostname = %hostname, raw = raw_count, "после нормализации не осталось процессов, отправка пропущена");
            CycleOutcome::Empty
        } else {
            if stats.truncated > 0 {
                warn!(
                    truncated = stats.truncated,
                    max_processes = self.normalize.max_records,
                    "список процессов усечён"
                );
            }
            let sub = build_submission(identity, metrics, processes);
            self.submit_with_retry(&sub).await
        };

        state.record_cycle(now_unix(), outcome);
        match outcome {
            CycleOutcome::Submitted {
                snapshot_id,
                processes,
            } => info!(
                hostname = %hostname,
                snapshot_id,
                processes,
                cycle = state.cycles_run,
                "снимок отправлен"
            ),
            CycleOutcome::Empty => {}
            other => warn!(
                hostname = %hostname,
                outcome = other.label(),
                consecutive_failures = state.consecutive_failures,
                "цикл агента завершился неудачей"
            ),
        }
        outcome
    }

    async fn submit_with_retry(&self, sub: &Submission) -> CycleOutcome {
        let mut retry = 0;
        loop {
            match self.submitter.submit(sub).await {
                Ok(accepted) => {
                    return CycleOutcome::Submitted {
                        snapshot_id: accepted.id,
                        processes: accepted.processes_count,
                    }
                }
                Err(SubmitError::Transient(reason)) => {
                    if retry >= self.retry.retries {
                        error!(
                            endpoint = self.submitter.endpoint(),
                            attempts = retry + 1,
                            reason = %reason,
                            "попытки отправки исчерпаны"
                        );
                        return CycleOutcome::RetriesExhausted;
                    }
                    retry += 1;
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        reason = %reason,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "временная ошибка отправки, повтор"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err @ SubmitError::FatalAuth { .. }) => {
                    error!(error = %err, "сервер не принимает API-ключ");
                    return CycleOutcome::AuthRejected;
                }
                Err(err @ SubmitError::Rejected { .. }) => {
                    error!(error = %err, "снимок отклонён сервером, ждём следующего цикла");
                    return CycleOutcome::PayloadRejected;
                }
            }
        }
    }
}

fn build_submission(
    identity: HostIdentity,
    metrics: SystemMetrics,
    processes: Vec<ProcessRecord>,
) -> Submission {
    debug!(hostname = %identity.hostname, processes = processes.len(), "сборка заявки");
    Submission {
        hostname: identity.hostname,
        ip_address: identity.ip_address,
        os_info: non_empty(identity.os_info),
        platform: non_empty(identity.platform),
        architecture: non_empty(identity.architecture),
        cpu_count: (identity.cpu_count > 0).then(|| i64::from(identity.cpu_count)),
        total_memory: Some(i64::try_from(identity.total_memory).unwrap_or(i64::MAX)),
        processes,
        system_metrics: metrics,
    }
}

fn non_empty(v: String) -> Option<String> {
    if v.trim().is_empty() {
        None
    } else {
        Some(v)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::RawProcess;
    use crate::http::test_support::{app, test_state, TEST_KEY};
    use crate::http::HttpAppState;
    use crate::tree::build_forest;
    use tokio::net::TcpListener;

    struct FakeSource {
        processes: Vec<RawProcess>,
    }

    impl ProcessSource for FakeSource {
        fn collect(&mut self) -> Collection {
            Collection {
                identity: HostIdentity {
                    hostname: "h1".to_string(),
                    ip_address: Some("10.1.2.3".to_string()),
                    os_info: "Linux 6.1".to_string(),
                    platform: "Linux".to_string(),
                    architecture: "x86_64".to_string(),
                    cpu_count: 4,
                    total_memory: 8 * 1024 * 1024 * 1024,
                },
                processes: self.processes.clone(),
                ..Collection::default()
            }
        }
    }

    fn raw(pid: u32, parent: Option<u32>, name: &str) -> RawProcess {
        RawProcess {
            pid,
            parent,
            name: Some(name.to_string()),
            ..RawProcess::default()
        }
    }

    fn h1_source() -> FakeSource {
        FakeSource {
            processes: vec![
                raw(3, Some(2), "editor"),
                raw(1, None, "init"),
                raw(2, Some(1), "shell"),
                raw(4, Some(1), "firefox"),
            ],
        }
    }

    fn agent_config(backend_url: String) -> AgentConfig {
        AgentConfig {
            backend_url,
            retry_attempts: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            request_timeout_secs: 5,
            ..AgentConfig::default()
        }
    }

    fn agent(source: FakeSource, cfg: &AgentConfig, key: &str) -> Agent<FakeSource> {
        let submitter = Submitter::new(
            &cfg.backend_url,
            key.to_string(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
        .expect("клиент");
        Agent::new(source, submitter, cfg)
    }

    async fn serve(state: &HttpAppState) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("порт");
        let addr = listener.local_addr().expect("адрес");
        let router = app(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/api/v1")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn cycle_delivers_a_reconstructable_snapshot() {
        let (_dir, state) = test_state().await;
        let cfg = agent_config(serve(&state).await);
        let mut agent = agent(h1_source(), &cfg, TEST_KEY);
        let mut agent_state = AgentState::new(0);

        let outcome = agent.run_cycle(&mut agent_state).await;
        let CycleOutcome::Submitted {
            snapshot_id,
            processes,
        } = outcome
        else {
            panic!("ожидалась успешная отправка, получено {outcome:?}");
        };
        assert_eq!(processes, 3);
        assert_eq!(agent_state.last_snapshot_id, Some(snapshot_id));

        let rows = state
            .store
            .snapshot_processes(snapshot_id)
            .await
            .expect("процессы снимка");
        assert!(rows.iter().all(|p| p.name != "firefox"));
        let forest = build_forest(rows);
        assert_eq!(forest.roots.len(), 1);
        let init = &forest.roots[0];
        assert_eq!(init.process.name, "init");
        assert_eq!(init.children[0].process.name, "shell");
        assert_eq!(init.children[0].children[0].process.name, "editor");

        let detail = state.store.snapshot(snapshot_id).await.expect("снимок");
        assert_eq!(detail.snapshot.hostname, "h1");
    }

    #[tokio::test]
    async fn wrong_key_stops_without_retry() {
        let (_dir, state) = test_state().await;
        let cfg = agent_config(serve(&state).await);
        let mut agent = agent(h1_source(), &cfg, "wrong");
        let mut agent_state = AgentState::new(0);

        assert_eq!(
            agent.run_cycle(&mut agent_state).await,
            CycleOutcome::AuthRejected
        );
        assert_eq!(agent_state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn closed_port_exhausts_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("порт");
        let addr = listener.local_addr().expect("адрес");
        drop(listener);

        let cfg = agent_config(format!("http://{addr}/api/v1"));
        let mut agent = agent(h1_source(), &cfg, TEST_KEY);
        let mut agent_state = AgentState::new(0);
        assert_eq!(
            agent.run_cycle(&mut agent_state).await,
            CycleOutcome::RetriesExhausted
        );
    }

    #[tokio::test]
    async fn nothing_to_send_skips_the_request() {
        let cfg = agent_config("http://127.0.0.1:9/api/v1".to_string());
        let source = FakeSource {
            processes: vec![raw(10, None, "Chrome Helper")],
        };
        let mut agent = agent(source, &cfg, TEST_KEY);
        let mut agent_state = AgentState::new(0);
        assert_eq!(agent.run_cycle(&mut agent_state).await, CycleOutcome::Empty);
        assert_eq!(agent_state.cycles_run, 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_hanging_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("порт");
        let addr = listener.local_addr().expect("адрес");
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("соединение");
            tokio::time::sleep(Duration::from_secs(120)).await;
            drop(socket);
        });

        let cfg = AgentConfig {
            request_timeout_secs: 60,
            ..agent_config(format!("http://{addr}/api/v1"))
        };
        let mut agent = agent(h1_source(), &cfg, TEST_KEY);
        let mut agent_state = AgentState::new(0);
        let shutdown = tokio::time::sleep(Duration::from_millis(200));

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            agent.run_until(&mut agent_state, Duration::from_secs(60), shutdown),
        )
        .await
        .expect("остановка не дождалась конца цикла");
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(agent_state.cycles_run, 0);
        server.abort();
    }

    #[tokio::test]
    async fn loop_ends_when_key_is_refused() {
        let (_dir, state) = test_state().await;
        let cfg = agent_config(serve(&state).await);
        let mut agent = agent(h1_source(), &cfg, "wrong");
        let mut agent_state = AgentState::new(0);
        let exit = agent
            .run_until(
                &mut agent_state,
                Duration::from_millis(10),
                std::future::pending::<()>(),
            )
            .await;
        assert_eq!(exit, LoopExit::AuthRejected);
        assert_eq!(agent_state.cycles_run, 1);
    }
}
