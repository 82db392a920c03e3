use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use crate::error::MinerError;
use crate::models::stream::{Channel, Liveness};
use crate::services::campaign_catalog::CampaignCatalog;
use crate::traits::DropsApi;

/// How many consecutive failed checks we tolerate before a known state is
/// downgraded to `Unknown`.
const UNKNOWN_TOLERANCE: u32 = 2;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LivenessChange {
    pub changed: bool,
    /// Channels that were live and are now offline or unknown
    pub went_offline: Vec<String>,
}

/// Live/viewer state of every channel attached to a watchable campaign.
#[derive(Debug, Default)]
pub struct LivenessOracle {
    channels: BTreeMap<String, Channel>,
    failed_checks: HashMap<String, u32>,
    last_report: Option<DateTime<Utc>>,
}

impl LivenessOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// One bounded liveness query. Used by the poller task, never by the loop.
    pub async fn query(
        api: &dyn DropsApi,
        channel_ids: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, Liveness>, MinerError> {
        if channel_ids.is_empty() {
            return Ok(HashMap::new());
        }
        match tokio::time::timeout(timeout, api.fetch_liveness(channel_ids)).await {
            Ok(result) => result,
            Err(_) => Err(MinerError::fetch_timeout("liveness query", timeout)),
        }
    }

    /// Rebuild channel membership from the catalog, keeping known liveness.
    pub fn sync_membership(&mut self, catalog: &CampaignCatalog, now: DateTime<Utc>) {
        let mut membership: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
        for campaign in catalog.campaigns().filter(|c| c.is_watchable(now)) {
            for ch in &campaign.channels {
                let entry = membership
                    .entry(ch.slug.clone())
                    .or_insert_with(|| (ch.display_name.clone(), BTreeSet::new()));
                entry.1.insert(campaign.id.clone());
            }
        }

        self.channels.retain(|id, _| membership.contains_key(id));
        self.failed_checks.retain(|id, _| membership.contains_key(id));
        for (id, (display_name, campaigns)) in membership {
            let channel = self
                .channels
                .entry(id.clone())
                .or_insert_with(|| Channel::new(id.clone(), display_name));
            channel.campaigns = campaigns;
        }
    }

    /// Merge a poll result. Channels missing from the report keep their state.
    pub fn apply(&mut self, report: &HashMap<String, Liveness>, now: DateTime<Utc>) -> LivenessChange {
        let mut change = LivenessChange::default();

        for (id, reported) in report {
            let Some(channel) = self.channels.get_mut(id) else {
                continue;
            };
            let previous = channel.liveness;

            let next = if *reported == Liveness::Unknown {
                let strikes = self.failed_checks.entry(id.clone()).or_insert(0);
                *strikes += 1;
                if previous == Liveness::Unknown || *strikes >= UNKNOWN_TOLERANCE {
                    Liveness::Unknown
                } else {
                    debug!("[Liveness] Check failed for {}, keeping last state", id);
                    previous
                }
            } else {
                self.failed_checks.remove(id);
                *reported
            };

            if next != previous {
                change.changed = true;
                if previous.is_live() && !next.is_live() {
                    info!("[Liveness] ⚫ {} went offline", id);
                    change.went_offline.push(id.clone());
                } else if !previous.is_live() && next.is_live() {
                    info!("[Liveness] 🟢 {} is live ({} viewers)", id, next.viewers().unwrap_or(0));
                }
                channel.liveness = next;
            }
        }

        self.last_report = Some(now);
        change
    }

    pub fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn last_report(&self) -> Option<DateTime<Utc>> {
        self.last_report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{campaign, live, FakeApi};

    fn oracle_with(channels: &[&str]) -> LivenessOracle {
        let mut catalog = CampaignCatalog::new();
        catalog.merge(vec![campaign("x", 0, &[50], channels)], Utc::now());
        let mut oracle = LivenessOracle::new();
        oracle.sync_membership(&catalog, Utc::now());
        oracle
    }

    #[test]
    fn test_membership_follows_catalog() {
        let mut catalog = CampaignCatalog::new();
        let now = Utc::now();
        catalog.merge(
            vec![campaign("x", 0, &[50], &["a", "b"]), campaign("y", 0, &[50], &["b"])],
            now,
        );
        let mut oracle = LivenessOracle::new();
        oracle.sync_membership(&catalog, now);
        assert_eq!(oracle.channel_ids(), vec!["a", "b"]);
        assert_eq!(oracle.get("b").unwrap().campaigns.len(), 2);

        oracle.apply(&HashMap::from([("a".to_string(), live(10))]), now);
        catalog.merge(vec![campaign("x", 0, &[50], &["a"])], now);
        oracle.sync_membership(&catalog, now);
        assert_eq!(oracle.channel_ids(), vec!["a"]);
        // Known liveness survives a membership resync
        assert!(oracle.get("a").unwrap().liveness.is_live());
    }

    #[test]
    fn test_went_offline_is_reported() {
        let mut oracle = oracle_with(&["a", "b"]);
        let now = Utc::now();
        let change = oracle.apply(
            &HashMap::from([("a".to_string(), live(10)), ("b".to_string(), Liveness::Offline)]),
            now,
        );
        assert!(change.changed);
        assert!(change.went_offline.is_empty());

        let change = oracle.apply(&HashMap::from([("a".to_string(), Liveness::Offline)]), now);
        assert_eq!(change.went_offline, vec!["a".to_string()]);

        let change = oracle.apply(&HashMap::from([("a".to_string(), Liveness::Offline)]), now);
        assert_eq!(change, LivenessChange::default());
    }

    #[test]
    fn test_single_failed_check_keeps_live_state() {
        let mut oracle = oracle_with(&["a"]);
        let now = Utc::now();
        oracle.apply(&HashMap::from([("a".to_string(), live(10))]), now);

        let change = oracle.apply(&HashMap::from([("a".to_string(), Liveness::Unknown)]), now);
        assert!(!change.changed);
        assert!(oracle.get("a").unwrap().liveness.is_live());

        let change = oracle.apply(&HashMap::from([("a".to_string(), Liveness::Unknown)]), now);
        assert_eq!(change.went_offline, vec!["a".to_string()]);
        assert_eq!(oracle.get("a").unwrap().liveness, Liveness::Unknown);
    }

    #[test]
    fn test_viewer_change_counts_as_change() {
        let mut oracle = oracle_with(&["a"]);
        let now = Utc::now();
        oracle.apply(&HashMap::from([("a".to_string(), live(10))]), now);
        let change = oracle.apply(&HashMap::from([("a".to_string(), live(50))]), now);
        assert!(change.changed);
        assert_eq!(oracle.get("a").unwrap().liveness.viewers(), Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out() {
        let api = FakeApi::new();
        api.hang_liveness(true);
        let err = LivenessOracle::query(&api, &["a".to_string()], Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, MinerError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_query_skips_empty_set() {
        let api = FakeApi::new();
        let report = LivenessOracle::query(&api, &[], Duration::from_secs(3)).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(api.liveness_calls(), 0);
    }
}
