pub mod classify;
pub mod derivatives;
pub mod extractor;
pub mod ingest;
pub mod links;
pub mod provider;
pub mod quests;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};

use bitz_contracts::errors::QuestError;
use bitz_contracts::events::EventWriter;
use bitz_contracts::guidance::GuidanceReply;
use bitz_contracts::history::{Conversation, FileHistoryStore, HistoryEntry, HistoryStore};
use bitz_contracts::metadata::QuestMetadata;
use bitz_contracts::species::{group_by_image, SpeciesDataset, SpeciesRecord};

use crate::classify::{ClassificationJob, ClassificationWorker};
use crate::derivatives::{ImageDerivativeCache, ResolutionClass};
use crate::extractor::SpeciesExtractor;
use crate::ingest::{file_name_of, ImageIngest};
use crate::links::{link_batch, LinkResult, SpeciesLinkCache};
use crate::provider::VisionProvider;
use crate::quests::{QuestListing, QuestMetadataCache};
use crate::session::{AnalysisSession, PromptLibrary, SessionRegistry};

pub struct EngineConfig {
    pub root: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    pub classify_workers: usize,
    pub session_capacity: usize,
    pub metadata_freshness: Duration,
    pub language: String,
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prompts_dir: None,
            classify_workers: 4,
            session_capacity: 64,
            metadata_freshness: quests::DEFAULT_FRESHNESS,
            language: "english".to_string(),
        }
    }
}

/// One photo submission: the image plus whatever context the client
/// attached. Only `quest_id` and `image_b64` are required.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    pub quest_id: String,
    pub user_id: Option<String>,
    pub image_b64: String,
    pub location: Option<Value>,
    pub coordinates: Option<Value>,
    pub flavor: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestInfo {
    pub quest_id: String,
    pub conversation: Conversation,
    pub species_csv: String,
    /// Dataset rows grouped per image, for gallery-style clients.
    pub gallery: Vec<(String, Vec<SpeciesRecord>)>,
    pub metadata: QuestMetadata,
}

/// The analysis core: owns the durable quest state under one root
/// directory plus every in-memory cache layered over it. One instance
/// per host process; everything it holds in memory is recomputable
/// from disk.
pub struct QuestEngine {
    root: PathBuf,
    language: String,
    events: EventWriter,
    provider: Arc<dyn VisionProvider>,
    prompts: Arc<PromptLibrary>,
    history: FileHistoryStore,
    ingest: ImageIngest,
    classifier: ClassificationWorker,
    sessions: SessionRegistry,
    links: SpeciesLinkCache,
    quests: QuestMetadataCache,
    derivatives: ImageDerivativeCache,
}

impl QuestEngine {
    pub fn new(config: EngineConfig, provider: Arc<dyn VisionProvider>) -> Self {
        let events = EventWriter::new(config.root.join("events.jsonl"));
        let prompts = Arc::new(PromptLibrary::load(config.prompts_dir.as_deref()));
        let extractor = SpeciesExtractor::new(Arc::clone(&provider));
        let classifier = ClassificationWorker::new(
            &config.root,
            extractor,
            events.clone(),
            config.classify_workers,
        );
        Self {
            history: FileHistoryStore::new(&config.root),
            ingest: ImageIngest::new(&config.root),
            classifier,
            sessions: SessionRegistry::new(config.session_capacity),
            links: SpeciesLinkCache::new(),
            quests: QuestMetadataCache::new(
                &config.root,
                events.clone(),
                config.metadata_freshness,
            ),
            derivatives: ImageDerivativeCache::new(&config.root, events.clone()),
            root: config.root,
            language: config.language,
            events,
            provider,
            prompts,
        }
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Full photo-submission flow: persist the image, kick off the
    /// background dataset classification, run the interactive guidance
    /// step and append the result to the conversation log.
    ///
    /// The guidance reply degrades to a structured error payload on
    /// provider failure; only validation and storage problems surface
    /// as errors, because those mean the submission was not recorded.
    pub fn analyze(&self, request: &AnalyzeRequest) -> Result<GuidanceReply, QuestError> {
        if request.quest_id.trim().is_empty() {
            return Err(QuestError::Validation("quest_id is required".to_string()));
        }
        let bytes = decode_image(&request.image_b64)?;

        let mut conversation = self.history.load(&request.quest_id)?;
        // context set on the first photo sticks for the quest
        let coordinates = conversation
            .coordinates
            .clone()
            .or_else(|| request.coordinates.clone());
        let location = conversation
            .location
            .clone()
            .or_else(|| request.location.clone());
        let language = request
            .language
            .clone()
            .unwrap_or_else(|| self.language.clone());

        let sequence_index = conversation.history.len();
        let image_path = self
            .ingest
            .save(&request.quest_id, sequence_index, &bytes)?;

        let session = self
            .sessions
            .get_or_create(&request.quest_id, || {
                AnalysisSession::new(Arc::clone(&self.provider), Arc::clone(&self.prompts))
            })
            .ok_or_else(|| QuestError::Storage("session registry unavailable".to_string()))?;
        let known_species = conversation.species_names();
        let reply = {
            let Ok(mut session) = session.lock() else {
                return Err(QuestError::Storage("session lock poisoned".to_string()));
            };
            session.analyze(
                &image_path,
                request.flavor.as_deref(),
                &known_species,
                &language,
            )
        };

        self.classifier.schedule(ClassificationJob {
            quest_id: request.quest_id.clone(),
            image_path: image_path.clone(),
            coordinates: request.coordinates.clone(),
            language,
        });

        let assistant =
            serde_json::to_value(&reply).map_err(QuestError::storage)?;
        conversation.history.push(HistoryEntry::for_image(
            chrono::Utc::now().timestamp().to_string(),
            file_name_of(&image_path),
            request.coordinates.clone(),
            assistant,
        ));
        if conversation.flavor.is_none() {
            conversation.flavor = request.flavor.clone();
        }
        if conversation.user_id.is_none() {
            conversation.user_id = request.user_id.clone();
        }
        conversation.coordinates = coordinates;
        conversation.location = location;
        self.history.save(&request.quest_id, &conversation)?;

        let _ = self.events.emit_for_quest(
            "image_analyzed",
            &request.quest_id,
            payload(json!({
                "image": file_name_of(&image_path),
                "sequence": sequence_index,
                "degraded": reply.error.is_some(),
            })),
        );
        Ok(reply)
    }

    /// Follow-up observation on a live session. Sessions are in-memory
    /// only, so after a restart or an eviction this is not-found; the
    /// client recovers by submitting a new photo.
    ///
    /// The exchange stays inside the session context; the durable log
    /// records photo submissions only, so derived statistics such as
    /// the image count are unaffected.
    pub fn answer(&self, quest_id: &str, answer: &str) -> Result<GuidanceReply, QuestError> {
        let session = self
            .sessions
            .get(quest_id)
            .ok_or_else(|| QuestError::not_found("session", quest_id))?;
        let reply = {
            let Ok(mut session) = session.lock() else {
                return Err(QuestError::Storage("session lock poisoned".to_string()));
            };
            session.answer(answer)
        };

        let _ = self.events.emit_for_quest(
            "answer_processed",
            quest_id,
            payload(json!({"degraded": reply.error.is_some()})),
        );
        Ok(reply)
    }

    pub fn link_species(&self, pairs: &[Vec<String>]) -> Result<Vec<LinkResult>, QuestError> {
        let results = link_batch(&self.links, &self.provider, pairs)?;
        let _ = self.events.emit(
            "species_linked",
            payload(json!({
                "pairs": results.len(),
                "cache_size": self.links.len(),
            })),
        );
        Ok(results)
    }

    pub fn quest_info(&self, quest_id: &str, force_reload: bool) -> Result<QuestInfo, QuestError> {
        let metadata = self.quests.quest_metadata(quest_id, force_reload)?;
        let conversation = self.history.load(quest_id)?;
        let dataset = SpeciesDataset::for_quest(&self.root, quest_id);
        let records = dataset.load()?;
        Ok(QuestInfo {
            quest_id: quest_id.to_string(),
            conversation,
            species_csv: dataset.read_text()?,
            gallery: group_by_image(&records),
            metadata,
        })
    }

    pub fn quest_list(&self) -> Result<QuestListing, QuestError> {
        self.quests.list_quests()
    }

    /// Path to serve for a stored image at the requested resolution.
    pub fn image_variant(
        &self,
        quest_id: &str,
        image_name: &str,
        resolution: &str,
    ) -> Result<PathBuf, QuestError> {
        if image_name.contains('/') || image_name.contains('\\') || image_name.contains("..") {
            return Err(QuestError::Validation(format!(
                "invalid image name: {image_name}"
            )));
        }
        let image_path = self.ingest.images_dir(quest_id).join(image_name);
        self.derivatives
            .variant(&image_path, ResolutionClass::parse(resolution))
    }

    pub fn delete_quest(&self, quest_id: &str) -> Result<(), QuestError> {
        quests::delete_quest(&self.root, quest_id)?;
        self.quests.evict(quest_id);
        let _ = self
            .events
            .emit_for_quest("quest_deleted", quest_id, payload(json!({})));
        Ok(())
    }

    /// Drains the background classification queue. Short-lived hosts
    /// call this before exit so scheduled work is not lost.
    pub fn wait_for_classification(&self) {
        self.classifier.wait_idle();
    }
}

fn payload(value: Value) -> bitz_contracts::events::EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

/// Accepts both a bare base64 payload and a `data:image/...;base64,`
/// URL, which is what browser clients send.
fn decode_image(image_b64: &str) -> Result<Vec<u8>, QuestError> {
    let trimmed = image_b64.trim();
    let payload = match trimmed.find("base64,") {
        Some(index) => &trimmed[index + "base64,".len()..],
        None => trimmed,
    };
    if payload.is_empty() {
        return Err(QuestError::Validation("no image data provided".to_string()));
    }
    BASE64
        .decode(payload)
        .map_err(|err| QuestError::Validation(format!("invalid image data: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use crate::provider::ScriptedProvider;

    use super::*;

    fn extraction_reply() -> String {
        json!({
            "birds": [
                {"scientific_name": "Pica pica", "common_name": "Magpie", "confidence": "high"}
            ]
        })
        .to_string()
    }

    fn guidance_reply(name: &str) -> String {
        json!({
            "species_identification": {
                "name": name,
                "what_is_it": "",
                "ecological_importance": "",
                "species_interactions": []
            },
            "sampling_guidance": {"question": "", "yes_action": "", "no_action": ""},
            "next_target": {"focus": "", "location": "", "importance": ""}
        })
        .to_string()
    }

    fn engine_with(root: &Path, replies: Vec<String>) -> QuestEngine {
        let provider: Arc<dyn VisionProvider> = Arc::new(ScriptedProvider::new(replies));
        let mut config = EngineConfig::new(root);
        config.classify_workers = 1;
        QuestEngine::new(config, provider)
    }

    fn analyze_request(quest_id: &str) -> AnalyzeRequest {
        AnalyzeRequest {
            quest_id: quest_id.to_string(),
            user_id: Some("u1".to_string()),
            image_b64: BASE64.encode(b"jpeg bytes"),
            coordinates: Some(json!({"latitude": "48.85", "longitude": "2.35"})),
            flavor: Some("basic".to_string()),
            ..AnalyzeRequest::default()
        }
    }

    #[test]
    fn analyze_persists_image_history_and_dataset() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        // session extraction, guidance, then the background classification
        let engine = engine_with(
            temp.path(),
            vec![
                extraction_reply(),
                guidance_reply("Pica pica"),
                extraction_reply(),
            ],
        );

        let reply = engine.analyze(&analyze_request("q1"))?;
        assert_eq!(reply.species_identification.name, "Pica pica");
        engine.wait_for_classification();

        assert!(temp
            .path()
            .join("images")
            .join("q1")
            .join("0_image.jpg")
            .is_file());

        let info = engine.quest_info("q1", false)?;
        assert_eq!(info.conversation.history.len(), 1);
        assert_eq!(
            info.conversation.history[0].image_filename.as_deref(),
            Some("0_image.jpg")
        );
        assert_eq!(info.metadata.nb_images, 1);
        assert!(info.species_csv.contains("Pica pica"));
        assert_eq!(info.gallery.len(), 1);
        assert_eq!(info.gallery[0].0, "0_image.jpg");
        Ok(())
    }

    #[test]
    fn answer_without_session_is_not_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine_with(temp.path(), Vec::new());
        let err = engine.answer("q1", "I saw a fox").expect_err("no session");
        assert!(err.is_not_found());
        Ok(())
    }

    #[test]
    fn answer_stays_out_of_the_durable_log() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine_with(
            temp.path(),
            vec![
                extraction_reply(),
                guidance_reply("Pica pica"),
                extraction_reply(),
                guidance_reply("Vulpes vulpes"),
            ],
        );

        engine.analyze(&analyze_request("q1"))?;
        engine.wait_for_classification();
        let reply = engine.answer("q1", "I followed the tracks")?;
        assert_eq!(reply.species_identification.name, "Vulpes vulpes");

        // only the photo submission is durable; the follow-up lives in
        // the session, so the image count does not move
        let conversation = engine.history.load("q1")?;
        assert_eq!(conversation.history.len(), 1);
        let info = engine.quest_info("q1", true)?;
        assert_eq!(info.metadata.nb_images, 1);
        Ok(())
    }

    #[test]
    fn delete_quest_removes_state_and_listing_entry() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine_with(
            temp.path(),
            vec![
                extraction_reply(),
                guidance_reply("Pica pica"),
                extraction_reply(),
            ],
        );
        engine.analyze(&analyze_request("q1"))?;
        engine.wait_for_classification();
        assert!(engine.quest_list()?.quests.contains_key("q1"));

        engine.delete_quest("q1")?;
        assert!(!temp.path().join("data").join("q1").exists());
        assert!(!temp.path().join("images").join("q1").exists());
        assert!(!engine.quest_list()?.quests.contains_key("q1"));
        assert!(engine.quest_info("q1", false).is_err());
        Ok(())
    }

    #[test]
    fn bad_image_payloads_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine_with(temp.path(), Vec::new());

        let mut request = analyze_request("q1");
        request.image_b64 = String::new();
        assert!(matches!(
            engine.analyze(&request),
            Err(QuestError::Validation(_))
        ));

        request.image_b64 = "!!not base64!!".to_string();
        assert!(matches!(
            engine.analyze(&request),
            Err(QuestError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn image_variant_rejects_path_traversal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let engine = engine_with(temp.path(), Vec::new());
        assert!(matches!(
            engine.image_variant("q1", "../secret.jpg", "thumb"),
            Err(QuestError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn data_url_payloads_decode() {
        let encoded = format!("data:image/jpeg;base64,{}", BASE64.encode(b"abc"));
        assert_eq!(decode_image(&encoded).unwrap(), b"abc");
        assert!(decode_image("   ").is_err());
    }
}
