use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::models::drops::{Campaign, CampaignStatus, ClaimKey, ProgressDelta};

/// Result of merging one fetch into the catalog.
#[derive(Debug, Default)]
pub struct CatalogMerge {
    pub deltas: Vec<ProgressDelta>,
    /// (reward id, image url) for reward tiers seen for the first time
    pub new_rewards: Vec<(String, String)>,
}

/// Local, merged view of every campaign the platform has shown us.
///
/// Progress only moves forward, claimed flags only go from false to true and
/// expired/completed campaigns are frozen.
#[derive(Debug, Default)]
pub struct CampaignCatalog {
    campaigns: BTreeMap<String, Campaign>,
    last_refresh: Option<DateTime<Utc>>,
}

impl CampaignCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, fetched: Vec<Campaign>, now: DateTime<Utc>) -> CatalogMerge {
        let mut outcome = CatalogMerge::default();
        let mut seen = HashSet::new();

        if fetched.is_empty() {
            info!("[Catalog] Fetch returned no campaigns");
        }

        for mut incoming in fetched {
            if incoming.id.is_empty() {
                continue;
            }
            seen.insert(incoming.id.clone());
            normalize_status(&mut incoming, now);

            match self.campaigns.get_mut(&incoming.id) {
                None => {
                    debug!(
                        "[Catalog] New campaign {} ({}) at {} units",
                        incoming.name, incoming.id, incoming.progress_units
                    );
                    outcome.new_rewards.extend(
                        incoming
                            .tiers
                            .iter()
                            .filter(|t| !t.image_url.is_empty())
                            .map(|t| (t.id.clone(), t.image_url.clone())),
                    );
                    outcome.deltas.push(ProgressDelta {
                        campaign_id: incoming.id.clone(),
                        previous_units: 0,
                        current_units: incoming.progress_units,
                        status: incoming.status,
                    });
                    self.campaigns.insert(incoming.id.clone(), incoming);
                }
                Some(existing) => {
                    if existing.status.is_terminal() {
                        continue;
                    }
                    if let Some(delta) = merge_existing(existing, incoming, now, &mut outcome.new_rewards) {
                        outcome.deltas.push(delta);
                    }
                }
            }
        }

        for campaign in self.campaigns.values_mut() {
            if !seen.contains(&campaign.id) && !campaign.status.is_terminal() {
                info!("[Catalog] Campaign {} no longer listed, marking expired", campaign.name);
                campaign.status = CampaignStatus::Expired;
                outcome.deltas.push(ProgressDelta {
                    campaign_id: campaign.id.clone(),
                    previous_units: campaign.progress_units,
                    current_units: campaign.progress_units,
                    status: CampaignStatus::Expired,
                });
            }
        }

        self.last_refresh = Some(now);
        outcome
    }

    /// Marks a tier as claimed. Returns true only on the false -> true transition.
    pub fn mark_claimed(&mut self, key: &ClaimKey) -> bool {
        let Some(campaign) = self.campaigns.get_mut(&key.campaign_id) else {
            return false;
        };
        let Some(tier) = campaign.tiers.iter_mut().find(|t| t.id == key.tier_id) else {
            return false;
        };
        if tier.claimed {
            return false;
        }
        tier.claimed = true;
        if campaign.status == CampaignStatus::Active && campaign.all_tiers_claimed() {
            info!("[Catalog] 🏁 Campaign {} completed", campaign.name);
            campaign.status = CampaignStatus::Completed;
        }
        true
    }

    pub fn get(&self, campaign_id: &str) -> Option<&Campaign> {
        self.campaigns.get(campaign_id)
    }

    pub fn campaigns(&self) -> impl Iterator<Item = &Campaign> {
        self.campaigns.values()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    /// Slugs of every channel attached to a watchable campaign.
    pub fn watchable_channel_ids(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        self.campaigns
            .values()
            .filter(|c| c.is_watchable(now))
            .flat_map(|c| c.channels.iter().map(|ch| ch.slug.clone()))
            .collect()
    }
}

fn normalize_status(campaign: &mut Campaign, now: DateTime<Utc>) {
    if campaign.status == CampaignStatus::Active {
        if campaign.has_ended(now) {
            campaign.status = CampaignStatus::Expired;
        } else if campaign.all_tiers_claimed() {
            campaign.status = CampaignStatus::Completed;
        }
    }
}

fn merge_existing(
    existing: &mut Campaign,
    mut incoming: Campaign,
    now: DateTime<Utc>,
    new_rewards: &mut Vec<(String, String)>,
) -> Option<ProgressDelta> {
    let previous_units = existing.progress_units;
    let previous_status = existing.status;
    let previously_claimed: HashSet<String> = existing
        .tiers
        .iter()
        .filter(|t| t.claimed)
        .map(|t| t.id.clone())
        .collect();

    if incoming.progress_units < previous_units {
        debug!(
            "[Catalog] Ignoring stale progress for {}: {} < {}",
            existing.name, incoming.progress_units, previous_units
        );
    }
    incoming.progress_units = incoming.progress_units.max(previous_units);

    for tier in incoming.tiers.iter_mut() {
        if existing.tier(&tier.id).is_none() && !tier.image_url.is_empty() {
            new_rewards.push((tier.id.clone(), tier.image_url.clone()));
        }
        tier.claimed = tier.claimed || previously_claimed.contains(&tier.id);
    }
    // A fetch may briefly report a tier as unclaimed after we claimed it; re-check completion
    normalize_status(&mut incoming, now);

    let claimed_now = incoming.tiers.iter().filter(|t| t.claimed).count();
    let changed = incoming.progress_units != previous_units
        || incoming.status != previous_status
        || claimed_now != previously_claimed.len();

    *existing = incoming;

    changed.then(|| ProgressDelta {
        campaign_id: existing.id.clone(),
        previous_units,
        current_units: existing.progress_units,
        status: existing.status,
    })
}
