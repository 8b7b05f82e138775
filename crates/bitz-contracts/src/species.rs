use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::QuestError;

pub const DATASET_FILENAME: &str = "species_data_english.csv";

const CSV_HEADER: &str =
    "image_name,taxonomic_group,scientific_name,common_name,confidence,notes,latitude,longitude";

/// One identified organism in one photo.
///
/// `confidence` and `taxonomic_group` are free-text passthrough from
/// the model; no closed vocabulary is enforced. Multiple records may
/// reference the same image, and repeated extraction runs may produce
/// duplicates: the dataset is a write-once log, not a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRecord {
    pub image_name: String,
    pub taxonomic_group: String,
    pub scientific_name: String,
    pub common_name: String,
    pub confidence: String,
    pub notes: String,
    pub latitude: String,
    pub longitude: String,
}

/// Append-only per-quest dataset, `species_data_english.csv`.
///
/// The append step must be serialized per quest by the caller: two
/// interleaved appends to one file can corrupt a row. The writer only
/// guarantees that the header is written exactly once, on first
/// creation.
#[derive(Debug, Clone)]
pub struct SpeciesDataset {
    path: PathBuf,
}

impl SpeciesDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_quest(root: impl AsRef<Path>, quest_id: &str) -> Self {
        Self::new(
            root.as_ref()
                .join("data")
                .join(quest_id)
                .join(DATASET_FILENAME),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn append(&self, records: &[SpeciesRecord]) -> Result<(), QuestError> {
        if records.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(QuestError::storage)?;
        }
        let write_header = !self.path.is_file();

        let mut body = String::new();
        if write_header {
            body.push_str(CSV_HEADER);
            body.push('\n');
        }
        for record in records {
            body.push_str(&csv_line(record));
            body.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(QuestError::storage)?;
        file.write_all(body.as_bytes()).map_err(QuestError::storage)
    }

    /// Raw CSV text, empty string when the dataset does not exist yet.
    pub fn read_text(&self) -> Result<String, QuestError> {
        if !self.path.is_file() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&self.path).map_err(QuestError::storage)
    }

    pub fn load(&self) -> Result<Vec<SpeciesRecord>, QuestError> {
        Ok(parse_dataset(&self.read_text()?))
    }
}

/// Dataset rows grouped by image reference, append order preserved
/// within each group. Read-side helper for gallery-style views.
pub fn group_by_image(records: &[SpeciesRecord]) -> Vec<(String, Vec<SpeciesRecord>)> {
    let mut groups: Vec<(String, Vec<SpeciesRecord>)> = Vec::new();
    for record in records {
        match groups
            .iter_mut()
            .find(|(image, _)| image == &record.image_name)
        {
            Some((_, rows)) => rows.push(record.clone()),
            None => groups.push((record.image_name.clone(), vec![record.clone()])),
        }
    }
    groups
}

pub fn parse_dataset(text: &str) -> Vec<SpeciesRecord> {
    let mut records = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        let field = |idx: usize| fields.get(idx).cloned().unwrap_or_default();
        records.push(SpeciesRecord {
            image_name: field(0),
            taxonomic_group: field(1),
            scientific_name: field(2),
            common_name: field(3),
            confidence: field(4),
            notes: field(5),
            latitude: field(6),
            longitude: field(7),
        });
    }
    records
}

fn csv_line(record: &SpeciesRecord) -> String {
    [
        record.image_name.as_str(),
        record.taxonomic_group.as_str(),
        record.scientific_name.as_str(),
        record.common_name.as_str(),
        record.confidence.as_str(),
        record.notes.as_str(),
        record.latitude.as_str(),
        record.longitude.as_str(),
    ]
    .iter()
    .map(|field| csv_field(field))
    .collect::<Vec<String>>()
    .join(",")
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(image: &str, group: &str, scientific: &str) -> SpeciesRecord {
        SpeciesRecord {
            image_name: image.to_string(),
            taxonomic_group: group.to_string(),
            scientific_name: scientific.to_string(),
            common_name: "Common".to_string(),
            confidence: "high".to_string(),
            notes: String::new(),
            latitude: "48.85".to_string(),
            longitude: "2.35".to_string(),
        }
    }

    #[test]
    fn append_writes_header_once() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dataset = SpeciesDataset::for_quest(temp.path(), "q1");

        dataset.append(&[record("0_image.jpg", "birds", "Pica pica")])?;
        dataset.append(&[record("1_image.jpg", "mammals", "Vulpes vulpes")])?;

        let text = dataset.read_text()?;
        let header_lines = text
            .lines()
            .filter(|line| line.starts_with("image_name,"))
            .count();
        assert_eq!(header_lines, 1);
        assert_eq!(text.lines().count(), 3);
        Ok(())
    }

    #[test]
    fn roundtrips_fields_with_commas_and_quotes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dataset = SpeciesDataset::for_quest(temp.path(), "q1");

        let mut tricky = record("0_image.jpg", "plants", "Rosa canina");
        tricky.notes = "partially visible, behind a \"fence\"".to_string();
        dataset.append(std::slice::from_ref(&tricky))?;

        let loaded = dataset.load()?;
        assert_eq!(loaded, vec![tricky]);
        Ok(())
    }

    #[test]
    fn append_empty_batch_creates_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dataset = SpeciesDataset::for_quest(temp.path(), "q1");
        dataset.append(&[])?;
        assert!(!dataset.exists());
        Ok(())
    }

    #[test]
    fn missing_dataset_loads_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dataset = SpeciesDataset::for_quest(temp.path(), "q1");
        assert!(dataset.load()?.is_empty());
        assert_eq!(dataset.read_text()?, "");
        Ok(())
    }

    #[test]
    fn group_by_image_preserves_first_seen_order() {
        let records = vec![
            record("0_image.jpg", "birds", "Pica pica"),
            record("1_image.jpg", "mammals", "Vulpes vulpes"),
            record("0_image.jpg", "plants", "Quercus robur"),
        ];
        let groups = group_by_image(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "0_image.jpg");
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, "1_image.jpg");
    }
}
