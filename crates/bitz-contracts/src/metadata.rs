use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::Conversation;
use crate::species::SpeciesRecord;

/// Derived per-quest statistics.
///
/// Everything here is a pure function of the durable conversation log
/// and species dataset, so cached snapshots are always safe to drop
/// and recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestMetadata {
    pub quest_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Value>,
    pub flavor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    pub duration_seconds: i64,
    pub nb_images: usize,
    pub species_count: usize,
    pub taxonomic_groups: BTreeMap<String, usize>,
    pub last_updated: String,
}

pub fn derive_metadata(
    quest_id: &str,
    conversation: &Conversation,
    records: &[SpeciesRecord],
) -> QuestMetadata {
    let first = conversation
        .history
        .first()
        .and_then(|entry| entry.timestamp.trim().parse::<i64>().ok());
    let last = conversation
        .history
        .last()
        .and_then(|entry| entry.timestamp.trim().parse::<i64>().ok());
    let duration_seconds = match (first, last) {
        (Some(start), Some(end)) => (end - start).max(0),
        _ => 0,
    };

    let mut taxonomic_groups: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        *taxonomic_groups
            .entry(record.taxonomic_group.clone())
            .or_insert(0) += 1;
    }

    QuestMetadata {
        quest_id: quest_id.to_string(),
        user_id: conversation
            .user_id
            .clone()
            .unwrap_or_else(|| "N/A".to_string()),
        location: conversation.location.clone(),
        coordinates: conversation.coordinates.clone(),
        flavor: conversation
            .flavor
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        started_at: first,
        duration_seconds,
        nb_images: conversation.history.len(),
        species_count: records.len(),
        taxonomic_groups,
        last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
    }
}
