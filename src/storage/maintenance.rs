use super::{Store, StoreError};
use crate::config::RetentionConfig;
use rusqlite::{params, TransactionBehavior};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub hosts_deactivated: usize,
    pub snapshots_pruned: usize,
    pub active_hosts: i64,
}

impl Store {
    pub async fn sweep(
        &self,
        now_ms: i64,
        retention: RetentionConfig,
    ) -> Result<SweepReport, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let hosts_deactivated = if retention.inactive_after_secs > 0 {
                let cutoff = now_ms.saturating_sub(secs_to_ms(retention.inactive_after_secs));
                tx.execute(
                    "UPDATE hosts SET is_active = 0 WHERE is_active = 1 AND last_seen_ms < ?1",
                    params![cutoff],
                )?
            } else {
                0
            };

            let snapshots_pruned = if retention.snapshot_max_age_secs > 0 {
                let cutoff = now_ms.saturating_sub(secs_to_ms(retention.snapshot_max_age_secs));
                tx.execute(
                    "DELETE FROM snapshots WHERE captured_at_ms < ?1",
                    params![cutoff],
                )?
            } else {
                0
            };

            let active_hosts: i64 =
                tx.query_row("SELECT COUNT(*) FROM hosts WHERE is_active = 1", [], |r| {
                    r.get(0)
                })?;
            tx.commit()?;

            Ok(SweepReport {
                hosts_deactivated,
                snapshots_pruned,
                active_hosts,
            })
        })
        .await
    }

    pub async fn active_host_count(&self) -> Result<i64, StoreError> {
        self.run(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM hosts WHERE is_active = 1",
                [],
                |r| r.get(0),
            )?)
        })
        .await
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
