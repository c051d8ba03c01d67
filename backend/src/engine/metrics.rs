use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::MatchStore;
use crate::error::MatchResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub searching_count: u64,
    pub active_proposals: u64,
    pub matches_created: u64,
    pub searches_started: u64,
}

/// Engine counters. The two gauges are store-wide and refreshed
/// periodically; the two counters are this process's own activity.
/// Everything is mirrored into the `metrics` facade for Prometheus.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    searching_count: AtomicU64,
    active_proposals: AtomicU64,
    matches_created: AtomicU64,
    searches_started: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_started(&self) {
        self.searches_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("searches_started_total").increment(1);
    }

    pub fn match_created(&self) {
        self.matches_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("matches_created_total").increment(1);
    }

    pub fn proposal_resolved(&self, status: &'static str) {
        metrics::counter!("proposals_resolved_total", "status" => status).increment(1);
    }

    pub async fn refresh(&self, store: &dyn MatchStore) -> MatchResult<MetricsSnapshot> {
        let counts = store.counts().await?;
        self.searching_count.store(counts.searching, Ordering::Relaxed);
        self.active_proposals.store(counts.open_proposals, Ordering::Relaxed);
        metrics::gauge!("searching_count").set(counts.searching as f64);
        metrics::gauge!("active_proposals").set(counts.open_proposals as f64);
        metrics::gauge!("active_matches").set(counts.open_matches as f64);
        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            searching_count: self.searching_count.load(Ordering::Relaxed),
            active_proposals: self.active_proposals.load(Ordering::Relaxed),
            matches_created: self.matches_created.load(Ordering::Relaxed),
            searches_started: self.searches_started.load(Ordering::Relaxed),
        }
    }
}

/// Installs the global Prometheus recorder. Call once per process.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{MatchType, SearchCriteria, SearchingUser};
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_refresh_reads_store_counts() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            let entry = SearchingUser::new(Uuid::new_v4(), MatchType::Standard, SearchCriteria::default(), None, Utc::now());
            store.enqueue(&entry, None).await.unwrap();
        }
        let metrics = MetricsCollector::new();
        metrics.search_started();
        metrics.match_created();

        let snapshot = metrics.refresh(&store).await.unwrap();
        assert_eq!(
            snapshot,
            MetricsSnapshot {
                searching_count: 3,
                active_proposals: 0,
                matches_created: 1,
                searches_started: 1,
            }
        );
    }
}
