use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use bitz_contracts::guidance::extract_json_object;
use bitz_contracts::species::SpeciesRecord;

use crate::provider::{system_message, user_message_with_image, CompletionRequest, VisionProvider};

/// Identifies species in a photo via the vision model.
///
/// Extraction is tolerant end to end: malformed model output yields an
/// empty record list, never an error. Only the provider call itself
/// can fail, and callers are expected to treat that the same way.
pub struct SpeciesExtractor {
    provider: Arc<dyn VisionProvider>,
}

impl SpeciesExtractor {
    pub fn new(provider: Arc<dyn VisionProvider>) -> Self {
        Self { provider }
    }

    /// Runs one identification call and flattens the grouped reply
    /// into dataset rows. `latitude`/`longitude` are left empty; the
    /// caller attaches coordinates.
    pub fn extract(&self, image_path: &Path, language: &str) -> Result<Vec<SpeciesRecord>> {
        let bytes = std::fs::read(image_path)
            .with_context(|| format!("failed reading {}", image_path.display()))?;
        let image_b64 = BASE64.encode(bytes);

        let request = CompletionRequest::new(vec![
            system_message(&taxonomy_prompt(language)),
            user_message_with_image("", &image_b64),
        ])
        .with_max_tokens(2048);
        let reply = self.provider.complete(&request)?;

        let image_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(parse_species_reply(&reply, &image_name))
    }
}

/// Flatten a grouped identification reply into flat records. Groups
/// whose value is not a list are skipped, as are entries with no
/// scientific name.
pub fn parse_species_reply(reply: &str, image_name: &str) -> Vec<SpeciesRecord> {
    let parsed = serde_json::from_str::<Value>(reply)
        .ok()
        .filter(Value::is_object)
        .or_else(|| extract_json_object(reply));
    let Some(Value::Object(groups)) = parsed else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for (taxonomic_group, entries) in groups {
        let Value::Array(entries) = entries else {
            continue;
        };
        for entry in entries {
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim()
                    .to_string()
            };
            let scientific_name = field("scientific_name");
            if scientific_name.is_empty() {
                continue;
            }
            records.push(SpeciesRecord {
                image_name: image_name.to_string(),
                taxonomic_group: taxonomic_group.clone(),
                scientific_name,
                common_name: field("common_name"),
                confidence: field("confidence"),
                notes: field("notes"),
                latitude: String::new(),
                longitude: String::new(),
            });
        }
    }
    records
}

/// Summary lines handed to the guidance call so it can talk about what
/// the extractor found.
pub fn species_summary_lines(records: &[SpeciesRecord]) -> String {
    records
        .iter()
        .map(|record| {
            format!(
                "{}, {}, {}, {}, {}",
                record.taxonomic_group,
                record.scientific_name,
                record.common_name,
                record.confidence,
                record.notes
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

fn taxonomy_prompt(language: &str) -> String {
    format!(
        r#"Analyze this image and identify all visible species. Return your findings in JSON format with the following structure:

{{
    "birds": [
        {{"scientific_name": "Scientific name", "common_name": "Common name in {language}", "confidence": "high/medium/low"}}
    ],
    "mammals": [...],
    "reptiles": [...],
    "amphibians": [...],
    "fish": [...],
    "insects": [...],
    "arachnids": [...],
    "mollusks": [...],
    "crustaceans": [...],
    "plants": [...],
    "fungi": [...],
    "other": [...]
}}

Guidelines:
1. Only include categories where species are detected
2. If uncertain about identification, include your best guess and mark confidence as "low"
3. For partially visible organisms, note this in an optional "notes" field
4. If multiple individuals of the same species appear, only list the species once
5. For cultivated plants or domesticated animals, note this status if identifiable
6. Prioritize accuracy over completeness - don't guess if identification isn't possible
7. For complex scenes with many species, prioritize the most prominent/visible organisms
"#
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::provider::ScriptedProvider;

    use super::*;

    fn grouped_reply() -> String {
        json!({
            "birds": [
                {"scientific_name": "Pica pica", "common_name": "Magpie", "confidence": "high"},
                {"scientific_name": "", "common_name": "unidentifiable"}
            ],
            "plants": [
                {"scientific_name": "Quercus robur", "common_name": "Oak", "confidence": "medium", "notes": "partially visible"}
            ],
            "fungi": "not a list"
        })
        .to_string()
    }

    #[test]
    fn parses_grouped_reply_into_rows() {
        let records = parse_species_reply(&grouped_reply(), "0_image.jpg");
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.image_name == "0_image.jpg"));
        let oak = records
            .iter()
            .find(|record| record.scientific_name == "Quercus robur")
            .expect("oak row");
        assert_eq!(oak.taxonomic_group, "plants");
        assert_eq!(oak.notes, "partially visible");
    }

    #[test]
    fn parses_fenced_reply() {
        let fenced = format!("Here you go:\n```json\n{}\n```", grouped_reply());
        let records = parse_species_reply(&fenced, "0_image.jpg");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn garbage_reply_yields_no_records() {
        assert!(parse_species_reply("no json here", "0_image.jpg").is_empty());
        assert!(parse_species_reply("[1, 2, 3]", "0_image.jpg").is_empty());
    }

    #[test]
    fn extract_reads_image_and_names_rows_after_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let image_path = temp.path().join("3_image.jpg");
        std::fs::write(&image_path, b"jpegbytes")?;

        let provider = Arc::new(ScriptedProvider::new(vec![grouped_reply()]));
        let extractor = SpeciesExtractor::new(provider);
        let records = extractor.extract(&image_path, "english")?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].image_name, "3_image.jpg");
        Ok(())
    }

    #[test]
    fn summary_lines_one_per_record() {
        let records = parse_species_reply(&grouped_reply(), "0_image.jpg");
        let summary = species_summary_lines(&records);
        assert_eq!(summary.lines().count(), 2);
        assert!(summary.contains("Pica pica"));
    }
}
