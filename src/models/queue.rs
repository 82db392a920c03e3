use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

lazy_static! {
    static ref KICK_CHANNEL_URL: Regex =
        Regex::new(r"^(?:https?://)?(?:www\.)?kick\.com/([A-Za-z0-9_\-]+)/?(?:[?#].*)?$")
            .expect("static regex");
    static ref BARE_SLUG: Regex = Regex::new(r"^[A-Za-z0-9_\-]+$").expect("static regex");
}

/// Accepts a bare slug or a kick.com channel URL and returns the lowercase slug.
pub fn normalize_channel_ref(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(caps) = KICK_CHANNEL_URL.captures(trimmed) {
        return caps.get(1).map(|m| m.as_str().to_lowercase());
    }
    if BARE_SLUG.is_match(trimmed) {
        return Some(trimmed.to_lowercase());
    }
    None
}

fn deserialize_channel_ref<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(value) => normalize_channel_ref(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid channel reference: {}", value))),
    }
}

/// One user-authored line of the watch queue. Lower `rank` wins.
///
/// An entry with a `minutes_target` stops matching once that much watch time
/// has been spent on it; `elapsed_seconds` carries time from earlier runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_channel_ref")]
    pub channel: Option<String>,
    pub rank: u32,
    #[serde(default, alias = "minutes")]
    pub minutes_target: u64, // 0 = no budget
    #[serde(default, alias = "elapsed")]
    pub elapsed_seconds: u64,
}

impl QueueEntry {
    pub fn channel(slug: &str, rank: u32) -> Self {
        Self {
            campaign_id: None,
            channel: normalize_channel_ref(slug),
            rank,
            minutes_target: 0,
            elapsed_seconds: 0,
        }
    }

    pub fn campaign(campaign_id: &str, rank: u32) -> Self {
        Self {
            campaign_id: Some(campaign_id.to_string()),
            channel: None,
            rank,
            minutes_target: 0,
            elapsed_seconds: 0,
        }
    }

    pub fn with_budget(mut self, minutes: u64) -> Self {
        self.minutes_target = minutes;
        self
    }

    /// Identity used to carry accrued time across queue edits.
    pub fn key(&self) -> String {
        format!(
            "{}|{}",
            self.campaign_id.as_deref().unwrap_or_default(),
            self.channel.as_deref().unwrap_or_default()
        )
    }

    /// Budget spent, counting `extra_seconds` watched during this run.
    pub fn is_done(&self, extra_seconds: u64) -> bool {
        self.minutes_target > 0 && self.elapsed_seconds.saturating_add(extra_seconds) >= self.minutes_target * 60
    }

    /// Does this entry cover `channel` watched for `campaign_id`?
    pub fn matches(&self, campaign_id: &str, channel: &str) -> bool {
        let campaign_ok = self
            .campaign_id
            .as_deref()
            .map_or(true, |id| id == campaign_id);
        let channel_ok = self.channel.as_deref().map_or(true, |slug| slug == channel);
        // An entry with neither reference matches nothing
        (self.campaign_id.is_some() || self.channel.is_some()) && campaign_ok && channel_ok
    }
}

/// Queue entries in their effective priority order: rank first, then
/// position in the user's list. This is a total order.
pub fn ordered_entries(entries: &[QueueEntry]) -> Vec<(usize, &QueueEntry)> {
    let mut ordered: Vec<(usize, &QueueEntry)> = entries.iter().enumerate().collect();
    ordered.sort_by(|(ia, a), (ib, b)| a.rank.cmp(&b.rank).then(ia.cmp(ib)));
    ordered
}

/// Watch seconds accrued per queue entry during this run.
#[derive(Debug, Default, Clone)]
pub struct QueueProgress {
    accrued: HashMap<String, u64>,
}

impl QueueProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accrued(&self, entry: &QueueEntry) -> u64 {
        self.accrued.get(&entry.key()).copied().unwrap_or(0)
    }

    pub fn is_done(&self, entry: &QueueEntry) -> bool {
        entry.is_done(self.accrued(entry))
    }

    /// The entry that owns (`campaign_id`, `channel`) right now: the first one
    /// in priority order that matches and still has budget left.
    pub fn active_entry<'a>(&self, entries: &'a [QueueEntry], campaign_id: &str, channel: &str) -> Option<&'a QueueEntry> {
        ordered_entries(entries)
            .into_iter()
            .map(|(_, entry)| entry)
            .find(|entry| entry.matches(campaign_id, channel) && !self.is_done(entry))
    }

    /// Credit `seconds` to the active entry. Returns true when that used up its budget.
    pub fn credit(&mut self, entries: &[QueueEntry], campaign_id: &str, channel: &str, seconds: u64) -> bool {
        let Some(entry) = self.active_entry(entries, campaign_id, channel) else {
            return false;
        };
        let total = self.accrued.entry(entry.key()).or_insert(0);
        *total += seconds;
        entry.is_done(*total)
    }

    /// `entries` with accrued time folded into `elapsed_seconds`.
    pub fn snapshot(&self, entries: &[QueueEntry]) -> Vec<QueueEntry> {
        entries
            .iter()
            .map(|entry| QueueEntry {
                elapsed_seconds: entry.elapsed_seconds.saturating_add(self.accrued(entry)),
                ..entry.clone()
            })
            .collect()
    }
}
