use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;

use bitz_contracts::guidance::{error_reply, fallback_reply, parse_guidance, GuidanceReply};

use crate::extractor::{species_summary_lines, SpeciesExtractor};
use crate::provider::{
    assistant_message, system_message, user_message, CompletionRequest, VisionProvider,
};

const BASIC_PROMPT: &str = r#"You are a field biodiversity sampling guide. You receive the species identified in the user's latest photo and the names of species identified earlier in the quest. Reply in JSON with exactly three top-level keys:
"species_identification": {"name", "what_is_it", "ecological_importance", "species_interactions" (list of short strings)},
"sampling_guidance": {"question", "yes_action", "no_action"},
"next_target": {"focus", "location", "importance"}.
Pick the most prominent newly seen species as the identification. Prefer suggesting targets that have not been identified yet. Keep every field short and concrete."#;

const DEFAULT_PROMPT: &str = r#"You are a field biodiversity sampling guide continuing an ongoing conversation. The user reports an observation; reply in JSON with exactly three top-level keys:
"species_identification": {"name", "what_is_it", "ecological_importance", "species_interactions" (list of short strings)},
"sampling_guidance": {"question", "yes_action", "no_action"},
"next_target": {"focus", "location", "importance"}.
Ground the reply in the conversation so far and give the user one clear next instruction."#;

/// Named analysis-prompt variants ("flavors"). Built-in `basic` and
/// `default` prompts are always present; a prompts directory of
/// `<flavor>.txt` files overlays them. Unknown flavors fall back to
/// `basic`.
pub struct PromptLibrary {
    prompts: HashMap<String, String>,
}

impl PromptLibrary {
    pub fn load(prompts_dir: Option<&Path>) -> Self {
        let mut prompts = HashMap::new();
        prompts.insert("basic".to_string(), BASIC_PROMPT.to_string());
        prompts.insert("default".to_string(), DEFAULT_PROMPT.to_string());

        if let Some(dir) = prompts_dir {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
                        continue;
                    }
                    let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                        continue;
                    };
                    if let Ok(text) = std::fs::read_to_string(&path) {
                        prompts.insert(key.to_string(), text);
                    }
                }
            }
        }
        Self { prompts }
    }

    pub fn resolve(&self, flavor: Option<&str>) -> &str {
        flavor
            .and_then(|flavor| self.prompts.get(flavor))
            .or_else(|| self.prompts.get("basic"))
            .map(String::as_str)
            .unwrap_or(BASIC_PROMPT)
    }

    pub fn followup(&self) -> &str {
        self.prompts
            .get("default")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PROMPT)
    }

    pub fn has_flavor(&self, flavor: &str) -> bool {
        self.prompts.contains_key(flavor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAnswer,
}

/// Per-quest conversational state machine.
///
/// The running context here is in-memory only and distinct from the
/// durable conversation log: sessions live as long as the hosting
/// process and are rebuilt empty after a restart. Every path out of
/// `analyze`/`answer` returns a structured reply; provider failures
/// and unparseable model output degrade to fallback payloads.
pub struct AnalysisSession {
    provider: Arc<dyn VisionProvider>,
    extractor: SpeciesExtractor,
    prompts: Arc<PromptLibrary>,
    context: Vec<Value>,
    state: SessionState,
}

impl AnalysisSession {
    pub fn new(provider: Arc<dyn VisionProvider>, prompts: Arc<PromptLibrary>) -> Self {
        let extractor = SpeciesExtractor::new(Arc::clone(&provider));
        Self {
            provider,
            extractor,
            prompts,
            context: Vec::new(),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context_len(&self) -> usize {
        self.context.len()
    }

    /// Two-step analysis: extract species from the image, then ask for
    /// guidance, passing previously identified names as a dedup hint.
    pub fn analyze(
        &mut self,
        image_path: &Path,
        flavor: Option<&str>,
        known_species: &[String],
        language: &str,
    ) -> GuidanceReply {
        let reply = match self.analyze_inner(image_path, flavor, known_species, language) {
            Ok(reply) => reply,
            Err(err) => error_reply(&format!("{err:#}")),
        };
        self.push_assistant(&reply);
        self.state = SessionState::AwaitingAnswer;
        reply
    }

    fn analyze_inner(
        &mut self,
        image_path: &Path,
        flavor: Option<&str>,
        known_species: &[String],
        language: &str,
    ) -> Result<GuidanceReply> {
        let records = self.extractor.extract(image_path, language)?;
        let summary = species_summary_lines(&records);

        let mut messages = vec![system_message(self.prompts.resolve(flavor))];
        messages.extend(self.context.iter().cloned());
        messages.push(user_message(&format!(
            "Here are the species found on the image: \n\n {summary}. Previous species identified: {}",
            known_species.join(", ")
        )));

        let raw = self.provider.complete(
            &CompletionRequest::new(messages)
                .expecting_json()
                .with_max_tokens(2048),
        )?;
        Ok(parse_guidance(&raw))
    }

    /// Follow-up step: fold the user's free-text observation into the
    /// context and ask for the next instruction.
    pub fn answer(&mut self, answer: &str) -> GuidanceReply {
        self.context
            .push(user_message(&format!("My observation: {answer}")));

        let mut messages = vec![system_message(self.prompts.followup())];
        messages.extend(self.context.iter().cloned());

        let reply = match self.provider.complete(
            &CompletionRequest::new(messages)
                .expecting_json()
                .with_max_tokens(1024),
        ) {
            Ok(raw) => parse_guidance(&raw),
            Err(err) => fallback_reply(&format!("Failed to process response: {err:#}")),
        };
        self.push_assistant(&reply);
        self.state = SessionState::Idle;
        reply
    }

    fn push_assistant(&mut self, reply: &GuidanceReply) {
        let serialized = serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string());
        self.context.push(assistant_message(&serialized));
    }
}

/// Bounded cache of live sessions keyed by quest ID.
///
/// Least-recently-used eviction keeps long-running hosts from leaking
/// a session per quest forever. An evicted or never-created session is
/// indistinguishable from one lost to a restart: `get` returns None
/// and the caller reports session-not-found.
pub struct SessionRegistry {
    capacity: usize,
    inner: Mutex<RegistryState>,
}

struct RegistryState {
    sessions: HashMap<String, Arc<Mutex<AnalysisSession>>>,
    recency: VecDeque<String>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                recency: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, quest_id: &str) -> Option<Arc<Mutex<AnalysisSession>>> {
        let mut state = self.inner.lock().ok()?;
        let session = state.sessions.get(quest_id).map(Arc::clone)?;
        state.touch(quest_id);
        Some(session)
    }

    pub fn get_or_create(
        &self,
        quest_id: &str,
        create: impl FnOnce() -> AnalysisSession,
    ) -> Option<Arc<Mutex<AnalysisSession>>> {
        let mut state = self.inner.lock().ok()?;
        if let Some(session) = state.sessions.get(quest_id).map(Arc::clone) {
            state.touch(quest_id);
            return Some(session);
        }

        let session = Arc::new(Mutex::new(create()));
        state
            .sessions
            .insert(quest_id.to_string(), Arc::clone(&session));
        state.recency.push_back(quest_id.to_string());
        while state.sessions.len() > self.capacity {
            let Some(oldest) = state.recency.pop_front() else {
                break;
            };
            state.sessions.remove(&oldest);
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|state| state.sessions.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryState {
    fn touch(&mut self, quest_id: &str) {
        if let Some(pos) = self.recency.iter().position(|id| id == quest_id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(quest_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::provider::ScriptedProvider;

    use super::*;

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

    fn extraction_reply() -> String {
        json!({
            "birds": [
                {"scientific_name": "Pica pica", "common_name": "Magpie", "confidence": "high"}
            ]
        })
        .to_string()
    }

    fn image_fixture(root: &Path) -> std::path::PathBuf {
        let path = root.join("0_image.jpg");
        std::fs::write(&path, b"jpeg").expect("image bytes");
        path
    }

    fn session_with(replies: Vec<String>) -> AnalysisSession {
        let provider: Arc<dyn VisionProvider> = Arc::new(ScriptedProvider::new(replies));
        AnalysisSession::new(provider, Arc::new(PromptLibrary::load(None)))
    }

    #[test]
    fn analyze_then_answer_tracks_state_and_context() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = session_with(vec![
            extraction_reply(),
            guidance_reply("Pica pica"),
            guidance_reply("Quercus robur"),
        ]);
        assert_eq!(session.state(), SessionState::Idle);

        let reply = session.analyze(&image_fixture(temp.path()), Some("basic"), &[], "en");
        assert_eq!(reply.species_identification.name, "Pica pica");
        assert!(reply.error.is_none());
        assert_eq!(session.state(), SessionState::AwaitingAnswer);
        assert_eq!(session.context_len(), 1);

        let followup = session.answer("I found an oak");
        assert_eq!(followup.species_identification.name, "Quercus robur");
        assert_eq!(session.state(), SessionState::Idle);
        // user observation + assistant reply on top of the first reply
        assert_eq!(session.context_len(), 3);
        Ok(())
    }

    #[test]
    fn provider_failure_degrades_to_error_reply() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = session_with(Vec::new());
        let reply = session.analyze(&image_fixture(temp.path()), None, &[], "en");
        assert_eq!(reply.species_identification.name, "Error Occurred");
        assert!(reply.error.is_some());
        Ok(())
    }

    #[test]
    fn answer_failure_falls_back_with_raw_text() {
        let mut session = session_with(Vec::new());
        let reply = session.answer("anything");
        assert_eq!(reply.species_identification.name, "Unknown Species");
        assert!(reply
            .raw_response
            .unwrap_or_default()
            .contains("Failed to process response"));
    }

    #[test]
    fn unknown_flavor_falls_back_to_basic() {
        let prompts = PromptLibrary::load(None);
        assert_eq!(prompts.resolve(Some("nonexistent")), prompts.resolve(None));
        assert!(prompts.has_flavor("basic"));
        assert!(prompts.has_flavor("default"));
    }

    #[test]
    fn prompt_directory_overlays_builtins() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("expert.txt"), "expert prompt")?;
        std::fs::write(temp.path().join("notes.md"), "ignored")?;
        let prompts = PromptLibrary::load(Some(temp.path()));
        assert_eq!(prompts.resolve(Some("expert")), "expert prompt");
        assert!(!prompts.has_flavor("notes"));
        Ok(())
    }

    #[test]
    fn registry_evicts_least_recently_used() {
        let registry = SessionRegistry::new(2);
        let make = || session_with(Vec::new());

        registry.get_or_create("q1", make);
        registry.get_or_create("q2", make);
        // touch q1 so q2 becomes the eviction candidate
        assert!(registry.get("q1").is_some());
        registry.get_or_create("q3", make);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("q2").is_none());
        assert!(registry.get("q1").is_some());
        assert!(registry.get("q3").is_some());
    }
}
