use chrono::{DateTime, Utc};
use log::{debug, info};
use std::cmp::{Ordering, Reverse};
use std::collections::{HashMap, HashSet};

use crate::models::mining::WatchTarget;
use crate::models::queue::{ordered_entries, QueueEntry, QueueProgress};
use crate::services::campaign_catalog::CampaignCatalog;
use crate::services::liveness_service::LivenessOracle;

/// One (channel, campaign) pair that could be watched right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub channel: String,
    pub campaign_id: String,
    pub campaign_name: String,
    /// (rank, position) of the best matching queue entry; all equal when the queue is empty
    pub queue_rank: (u32, usize),
    /// Units left until the nearest open tier
    pub urgency: u64,
    pub viewers: u64,
}

impl Candidate {
    fn sort_key(&self) -> ((u32, usize), u64, Reverse<u64>, &str, &str) {
        (
            self.queue_rank,
            self.urgency,
            Reverse(self.viewers),
            &self.channel,
            &self.campaign_id,
        )
    }

    pub fn to_target(&self, now: DateTime<Utc>) -> WatchTarget {
        WatchTarget {
            channel: self.channel.clone(),
            campaign_id: self.campaign_id.clone(),
            campaign_name: self.campaign_name.clone(),
            selected_at: now,
        }
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Everything a recompute looks at. Borrowed from the mining loop.
pub struct ScheduleInput<'a> {
    pub catalog: &'a CampaignCatalog,
    pub oracle: &'a LivenessOracle,
    pub queue: &'a [QueueEntry],
    pub queue_progress: &'a QueueProgress,
    pub preferred_games: &'a [String],
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Current target is still the best choice
    Keep,
    /// Same channel, but it now counts toward a different campaign
    Retarget(Candidate),
    Switch(Candidate),
    /// Nothing qualifies; go idle
    Clear,
}

/// All qualifying candidates, best first.
pub fn rank_candidates(input: &ScheduleInput<'_>, excluded: &HashSet<String>) -> Vec<Candidate> {
    let ordered_queue = ordered_entries(input.queue);
    let preferred: Vec<String> = input
        .preferred_games
        .iter()
        .map(|g| g.trim().to_lowercase())
        .filter(|g| !g.is_empty())
        .collect();

    let mut candidates = Vec::new();

    for campaign in input.catalog.campaigns() {
        if !campaign.is_watchable(input.now) {
            continue;
        }
        if !preferred.is_empty()
            && !preferred.contains(&campaign.game.to_lowercase())
            && !preferred.contains(&campaign.game_slug.to_lowercase())
        {
            continue;
        }
        let Some(urgency) = campaign.remaining_to_next_tier() else {
            continue;
        };

        for ch in &campaign.channels {
            if excluded.contains(&ch.slug) {
                continue;
            }
            let Some(channel) = input.oracle.get(&ch.slug) else {
                continue;
            };
            let Some(viewers) = channel.liveness.viewers() else {
                continue;
            };
            if let (Some(wanted), Some(streaming)) = (campaign.category_id, channel.liveness.category_id()) {
                if wanted != streaming {
                    debug!(
                        "[Scheduler] {} streams category {} instead of {} for {}",
                        ch.slug, streaming, wanted, campaign.name
                    );
                    continue;
                }
            }

            let queue_rank = if ordered_queue.is_empty() {
                (0, 0)
            } else {
                match ordered_queue
                    .iter()
                    .position(|(_, entry)| {
                        entry.matches(&campaign.id, &ch.slug) && !input.queue_progress.is_done(entry)
                    })
                {
                    Some(position) => (ordered_queue[position].1.rank, position),
                    None => continue,
                }
            };

            candidates.push(Candidate {
                channel: ch.slug.clone(),
                campaign_id: campaign.id.clone(),
                campaign_name: campaign.name.clone(),
                queue_rank,
                urgency,
                viewers,
            });
        }
    }

    candidates.sort();
    candidates
}

/// Top candidate, if any.
pub fn select(input: &ScheduleInput<'_>, excluded: &HashSet<String>) -> Option<Candidate> {
    rank_candidates(input, excluded).into_iter().next()
}

/// Holds the scheduler's only memory between recomputes: channels that
/// failed recently, with the ticks left before they may be picked again.
#[derive(Debug)]
pub struct ChannelScheduler {
    cooldown_ticks: u32,
    cooling: HashMap<String, u32>,
}

impl ChannelScheduler {
    pub fn new(cooldown_ticks: u32) -> Self {
        Self {
            cooldown_ticks: cooldown_ticks.max(1),
            cooling: HashMap::new(),
        }
    }

    /// Keep `channel` out of every recompute until the cooldown has ticked away.
    pub fn exclude(&mut self, channel: &str) {
        info!("[Scheduler] Excluding {} for {} ticks", channel, self.cooldown_ticks);
        self.cooling.insert(channel.to_string(), self.cooldown_ticks);
    }

    pub fn is_excluded(&self, channel: &str) -> bool {
        self.cooling.contains_key(channel)
    }

    /// Advance cooldowns by one tick.
    pub fn on_tick(&mut self) {
        self.cooling.retain(|channel, left| {
            *left -= 1;
            if *left == 0 {
                debug!("[Scheduler] {} is eligible again", channel);
            }
            *left > 0
        });
    }

    /// Run one recompute. With `hold_current` a current target that still
    /// qualifies is kept even when something ranks above it, so a session
    /// that is still starting is not torn down by a routine recompute.
    pub fn recompute(&mut self, current: Option<&WatchTarget>, input: &ScheduleInput<'_>, hold_current: bool) -> Decision {
        let excluded: HashSet<String> = self.cooling.keys().cloned().collect();
        let ranked = rank_candidates(input, &excluded);
        let Some(best) = ranked.first() else {
            if current.is_some() {
                info!("[Scheduler] No channel qualifies, going idle");
            }
            return Decision::Clear;
        };

        if let Some(target) = current {
            let mine = if hold_current {
                ranked.iter().find(|c| c.channel == target.channel)
            } else {
                Some(best).filter(|c| c.channel == target.channel)
            };
            if let Some(candidate) = mine {
                if candidate.campaign_id == target.campaign_id {
                    return Decision::Keep;
                }
                debug!(
                    "[Scheduler] {} now counts toward {} instead of {}",
                    candidate.channel, candidate.campaign_name, target.campaign_name
                );
                return Decision::Retarget(candidate.clone());
            }
        }

        info!(
            "[Scheduler] 🎯 Selected {} for {} (rank {:?}, {} units left, {} viewers)",
            best.channel, best.campaign_name, best.queue_rank, best.urgency, best.viewers
        );
        Decision::Switch(best.clone())
    }
}
