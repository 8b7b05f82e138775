use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::QuestError;

/// One durable record of a single user/photo interaction.
///
/// Entries are immutable once appended; the log is append-only and is
/// only ever removed by whole-quest deletion. `timestamp` is a string
/// of unix seconds, matching the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub user: String,
    pub timestamp: String,
    pub assistant: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_location: Option<Value>,
}

impl HistoryEntry {
    pub fn for_image(
        timestamp: impl Into<String>,
        image_filename: impl Into<String>,
        image_location: Option<Value>,
        assistant: Value,
    ) -> Self {
        Self {
            user: String::new(),
            timestamp: timestamp.into(),
            assistant,
            image_filename: Some(image_filename.into()),
            image_location,
        }
    }

    /// Species name the assistant identified in this entry, if any.
    /// Tolerates both object payloads and payloads stored as JSON text.
    pub fn species_name(&self) -> Option<String> {
        let payload = match &self.assistant {
            Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
            other => other.clone(),
        };
        payload
            .get("species_identification")
            .and_then(|ident| ident.get("name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

/// The per-quest conversation document as persisted in `history.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Value>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Names of species already identified, in append order. Used as a
    /// dedup hint for the guidance call, not enforced anywhere.
    pub fn species_names(&self) -> Vec<String> {
        self.history
            .iter()
            .filter_map(HistoryEntry::species_name)
            .collect()
    }
}

/// Durable conversation log, keyed by quest ID.
///
/// The backing store is pluggable; the file implementation below is
/// the deployed default. At most one foreground writer per quest is
/// assumed. Interleaved readers must see either the pre- or post-write
/// document, never a torn one, but lost updates under truly concurrent
/// writers to one quest are not prevented.
pub trait HistoryStore: Send + Sync {
    /// Missing quests load as an empty conversation, not an error.
    fn load(&self, quest_id: &str) -> Result<Conversation, QuestError>;

    /// Replaces the whole document. Failures are storage errors and
    /// must surface synchronously: the caller has usually already
    /// saved an image and needs to know the log write did not stick.
    fn save(&self, quest_id: &str, conversation: &Conversation) -> Result<(), QuestError>;

    /// Appends one entry, preserving the document's top-level fields.
    fn append(&self, quest_id: &str, entry: HistoryEntry) -> Result<(), QuestError> {
        let mut conversation = self.load(quest_id)?;
        conversation.history.push(entry);
        self.save(quest_id, &conversation)
    }
}

/// `history/data/<quest_id>/history.json`, one document per quest.
#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    root: PathBuf,
}

impl FileHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn quest_dir(&self, quest_id: &str) -> PathBuf {
        self.root.join("data").join(quest_id)
    }

    pub fn history_path(&self, quest_id: &str) -> PathBuf {
        self.quest_dir(quest_id).join("history.json")
    }

    pub fn exists(&self, quest_id: &str) -> bool {
        self.history_path(quest_id).is_file()
    }
}

impl HistoryStore for FileHistoryStore {
    fn load(&self, quest_id: &str) -> Result<Conversation, QuestError> {
        let path = self.history_path(quest_id);
        if !path.exists() {
            return Ok(Conversation::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(QuestError::storage)?;
        serde_json::from_str(&raw).map_err(QuestError::storage)
    }

    fn save(&self, quest_id: &str, conversation: &Conversation) -> Result<(), QuestError> {
        let path = self.history_path(quest_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(QuestError::storage)?;
        }
        let payload =
            serde_json::to_string_pretty(conversation).map_err(QuestError::storage)?;
        write_replace(&path, payload.as_bytes()).map_err(QuestError::storage)
    }
}

/// Write via a sibling temp file and rename so a concurrent reader
/// sees either the old or the new document.
fn write_replace(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
