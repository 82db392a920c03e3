use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Live state of a channel as last reported by the liveness oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    #[default]
    Unknown,
    Offline,
    Live {
        viewers: u64,
        #[serde(default)]
        category_id: Option<u64>,
    },
}

impl Liveness {
    pub fn is_live(&self) -> bool {
        matches!(self, Liveness::Live { .. })
    }

    pub fn viewers(&self) -> Option<u64> {
        match self {
            Liveness::Live { viewers, .. } => Some(*viewers),
            _ => None,
        }
    }

    pub fn category_id(&self) -> Option<u64> {
        match self {
            Liveness::Live { category_id, .. } => *category_id,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Kick channel slug, e.g. `xqc`
    pub id: String,
    pub display_name: String,
    pub liveness: Liveness,
    /// Active campaigns this channel is eligible for
    pub campaigns: BTreeSet<String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            liveness: Liveness::Unknown,
            campaigns: BTreeSet::new(),
        }
    }

    pub fn url(&self) -> String {
        format!("https://kick.com/{}", self.id)
    }
}
