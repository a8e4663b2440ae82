use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Submitted { snapshot_id: i64, processes: usize },
    Empty,
    RetriesExhausted,
    AuthRejected,
    PayloadRejected,
}

impl CycleOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, CycleOutcome::Submitted { .. } | CycleOutcome::Empty)
    }

    pub fn label(self) -> &'static str {
        match self {
            CycleOutcome::Submitted { .. } => "submitted",
            CycleOutcome::Empty => "empty",
            CycleOutcome::RetriesExhausted => "retries_exhausted",
            CycleOutcome::AuthRejected => "auth_rejected",
            CycleOutcome::PayloadRejected => "payload_rejected",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentState {
    pub started_at_unix: i64,
    pub cycles_run: u64,
    pub last_cycle_unix: Option<i64>,
    pub last_outcome: Option<CycleOutcome>,
    pub consecutive_failures: u32,
    pub last_snapshot_id: Option<i64>,
}

impl AgentState {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn record_cycle(&mut self, now_unix: i64, outcome: CycleOutcome) {
        self.cycles_run += 1;
        self.last_cycle_unix = Some(now_unix);
        self.last_outcome = Some(outcome);
        if outcome.is_failure() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.consecutive_failures = 0;
        }
        if let CycleOutcome::Submitted { snapshot_id, .. } = outcome {
            self.last_snapshot_id = Some(snapshot_id);
        }
    }

    pub fn uptime_secs(&self, now_unix: i64) -> i64 {
        now_unix.saturating_sub(self.started_at_unix)
    }
}
