use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use bitz_contracts::errors::QuestError;
use bitz_contracts::events::EventWriter;
use bitz_contracts::history::{FileHistoryStore, HistoryStore};
use bitz_contracts::metadata::{derive_metadata, QuestMetadata};
use bitz_contracts::species::SpeciesDataset;

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);

/// Quest IDs present on disk: directory names under `data/`, hidden
/// entries excluded, sorted for stable output.
pub fn list_quest_ids(root: &Path) -> Vec<String> {
    let data_dir = root.join("data");
    let Ok(entries) = std::fs::read_dir(&data_dir) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    ids.sort();
    ids
}

/// Cascading removal of a quest: conversation log, dataset and images
/// go together. The derivative cache is left alone; its entries are
/// keyed by path hash and merely go cold.
pub fn delete_quest(root: &Path, quest_id: &str) -> Result<(), QuestError> {
    let data_dir = root.join("data").join(quest_id);
    if !data_dir.exists() {
        return Err(QuestError::not_found("quest", quest_id));
    }
    std::fs::remove_dir_all(&data_dir).map_err(QuestError::storage)?;

    let images_dir = root.join("images").join(quest_id);
    if images_dir.exists() {
        std::fs::remove_dir_all(&images_dir).map_err(QuestError::storage)?;
    }
    Ok(())
}

/// Derive metadata for one quest straight from durable state.
pub fn compute_metadata(root: &Path, quest_id: &str) -> Result<QuestMetadata, QuestError> {
    let store = FileHistoryStore::new(root);
    if !store.exists(quest_id) {
        return Err(QuestError::not_found("quest", quest_id));
    }
    let conversation = store.load(quest_id)?;
    let records = SpeciesDataset::for_quest(root, quest_id).load()?;
    Ok(derive_metadata(quest_id, &conversation, &records))
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub status: &'static str,
    pub total_cached: usize,
    pub new_quests_added: usize,
    pub quests_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestListing {
    pub quests: BTreeMap<String, QuestMetadata>,
    pub cache_info: CacheInfo,
}

/// Time-bounded cache of derived per-quest statistics.
///
/// A full refresh is skipped while the last one is inside the
/// freshness window AND the set of quest IDs on disk is unchanged.
/// Otherwise the cache reconciles by set difference: evict removed
/// quests, compute metadata only for newly seen ones. Everything it
/// holds is recomputable, so eviction is always safe.
pub struct QuestMetadataCache {
    root: PathBuf,
    freshness: Duration,
    events: EventWriter,
    state: Mutex<CacheState>,
}

struct CacheState {
    metadata: HashMap<String, QuestMetadata>,
    cached_ids: HashSet<String>,
    last_full_update: Option<Instant>,
}

impl QuestMetadataCache {
    pub fn new(root: impl Into<PathBuf>, events: EventWriter, freshness: Duration) -> Self {
        Self {
            root: root.into(),
            freshness,
            events,
            state: Mutex::new(CacheState {
                metadata: HashMap::new(),
                cached_ids: HashSet::new(),
                last_full_update: None,
            }),
        }
    }

    /// Metadata for one quest. `force_reload` bypasses the cache
    /// irrespective of freshness and refreshes the stored entry.
    pub fn quest_metadata(
        &self,
        quest_id: &str,
        force_reload: bool,
    ) -> Result<QuestMetadata, QuestError> {
        if !force_reload {
            if let Ok(state) = self.state.lock() {
                if let Some(metadata) = state.metadata.get(quest_id) {
                    return Ok(metadata.clone());
                }
            }
        }
        let metadata = compute_metadata(&self.root, quest_id)?;
        // only the metadata map; cached_ids tracks what the listing
        // refresh has seen, so a quest first fetched here still counts
        // as new on the next reconciliation
        if let Ok(mut state) = self.state.lock() {
            state
                .metadata
                .insert(quest_id.to_string(), metadata.clone());
        }
        Ok(metadata)
    }

    pub fn list_quests(&self) -> Result<QuestListing, QuestError> {
        let current_ids: HashSet<String> = list_quest_ids(&self.root).into_iter().collect();

        let mut state = self
            .state
            .lock()
            .map_err(|_| QuestError::Storage("metadata cache lock poisoned".to_string()))?;

        let fresh = state
            .last_full_update
            .map(|at| at.elapsed() <= self.freshness)
            .unwrap_or(false);
        if fresh && state.cached_ids == current_ids {
            return Ok(QuestListing {
                quests: state.snapshot(),
                cache_info: CacheInfo {
                    status: "cached",
                    total_cached: state.metadata.len(),
                    new_quests_added: 0,
                    quests_removed: 0,
                },
            });
        }

        let removed: Vec<String> = state
            .cached_ids
            .difference(&current_ids)
            .cloned()
            .collect();
        for quest_id in &removed {
            state.metadata.remove(quest_id);
        }

        let new_ids: Vec<String> = current_ids
            .difference(&state.cached_ids)
            .cloned()
            .collect();
        let mut added = 0;
        for quest_id in &new_ids {
            // quests with no conversation log yet are skipped, not errors
            match compute_metadata(&self.root, quest_id) {
                Ok(metadata) => {
                    state.metadata.insert(quest_id.clone(), metadata);
                    added += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        state.cached_ids = current_ids;
        state.last_full_update = Some(Instant::now());

        let _ = self.events.emit(
            "quest_cache_refreshed",
            json!({
                "total_cached": state.metadata.len(),
                "new_quests_added": added,
                "quests_removed": removed.len(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        );

        Ok(QuestListing {
            quests: state.snapshot(),
            cache_info: CacheInfo {
                status: "updated",
                total_cached: state.metadata.len(),
                new_quests_added: added,
                quests_removed: removed.len(),
            },
        })
    }

    /// Drops a single quest from the cache, e.g. after deletion.
    pub fn evict(&self, quest_id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.metadata.remove(quest_id);
            state.cached_ids.remove(quest_id);
        }
    }
}

impl CacheState {
    fn snapshot(&self) -> BTreeMap<String, QuestMetadata> {
        self.metadata
            .iter()
            .map(|(quest_id, metadata)| (quest_id.clone(), metadata.clone()))
            .collect()
    }
}
