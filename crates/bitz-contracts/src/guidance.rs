use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured "what is it / what next" reply shown to the user after
/// every analyze or answer step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuidanceReply {
    #[serde(default)]
    pub species_identification: SpeciesIdentification,
    #[serde(default)]
    pub sampling_guidance: SamplingGuidance,
    #[serde(default)]
    pub next_target: NextTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesIdentification {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub what_is_it: String,
    #[serde(default)]
    pub ecological_importance: String,
    #[serde(default)]
    pub species_interactions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingGuidance {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub yes_action: String,
    #[serde(default)]
    pub no_action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NextTarget {
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub importance: String,
}

impl GuidanceReply {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

const REQUIRED_KEYS: [&str; 3] = ["species_identification", "sampling_guidance", "next_target"];

/// Parse a model reply into a guidance payload.
///
/// Strict parse first; when the reply carries extra prose or broken
/// framing, recover the first embedded JSON object; when nothing
/// usable remains, return the fixed fallback carrying the raw text.
/// Callers never see an error from this path.
pub fn parse_guidance(text: &str) -> GuidanceReply {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if has_required_keys(&value) {
            if let Ok(reply) = serde_json::from_value::<GuidanceReply>(value) {
                return reply;
            }
        }
    }
    if let Some(value) = extract_json_object(text) {
        if has_required_keys(&value) {
            if let Ok(reply) = serde_json::from_value::<GuidanceReply>(value) {
                return reply;
            }
        }
    }
    fallback_reply(text)
}

fn has_required_keys(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    REQUIRED_KEYS.iter().all(|key| obj.contains_key(*key))
}

/// Best-effort extraction of a JSON object from free text: fenced
/// ```json blocks first, then the first balanced-brace span.
pub fn extract_json_object(text: &str) -> Option<Value> {
    for block in fenced_json_blocks(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    let span = balanced_brace_span(text)?;
    serde_json::from_str::<Value>(span)
        .ok()
        .filter(Value::is_object)
}

fn fenced_json_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```json") {
        let after = &rest[start + "```json".len()..];
        let Some(end) = after.find("```") else {
            break;
        };
        blocks.push(after[..end].trim().to_string());
        rest = &after[end + 3..];
    }
    blocks
}

fn balanced_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fixed reply used when every parse attempt fails. Carries the first
/// 500 characters of the raw model text for inspection.
pub fn fallback_reply(raw: &str) -> GuidanceReply {
    GuidanceReply {
        species_identification: SpeciesIdentification {
            name: "Unknown Species".to_string(),
            what_is_it: "The system detected something in the image.".to_string(),
            ecological_importance: "Ecological importance could not be determined automatically."
                .to_string(),
            species_interactions: vec![
                "Further analysis needed to determine interactions.".to_string()
            ],
        },
        sampling_guidance: SamplingGuidance {
            question: "Would you like to try again with a better image?".to_string(),
            yes_action: "Take a clearer photo with better lighting.".to_string(),
            no_action: "Look for a different subject to photograph instead.".to_string(),
        },
        next_target: NextTarget {
            focus: "Try to find something with distinctive features.".to_string(),
            location: "Look in well-lit areas for clearer subjects.".to_string(),
            importance: "Clear images help with accurate identification and ecological assessment."
                .to_string(),
        },
        raw_response: Some(truncate_raw(raw, 500)),
        error: None,
    }
}

/// Reply used when the provider call itself failed. Still structured:
/// a broken guidance message beats a dead end.
pub fn error_reply(message: &str) -> GuidanceReply {
    GuidanceReply {
        species_identification: SpeciesIdentification {
            name: "Error Occurred".to_string(),
            what_is_it: "An error occurred during processing.".to_string(),
            ecological_importance: "Unable to analyze at this time.".to_string(),
            species_interactions: vec!["Error processing image.".to_string()],
        },
        sampling_guidance: SamplingGuidance {
            question: "Would you like to try again?".to_string(),
            yes_action: "Take a clearer photo with better lighting.".to_string(),
            no_action: "Try a different subject.".to_string(),
        },
        next_target: NextTarget {
            focus: "Look for clearly visible subjects.".to_string(),
            location: "Areas with good lighting and minimal obstructions.".to_string(),
            importance: "Clear images allow for better identification and analysis.".to_string(),
        },
        raw_response: None,
        error: Some(format!("Analysis failed: {message}")),
    }
}

fn truncate_raw(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "..."
}
