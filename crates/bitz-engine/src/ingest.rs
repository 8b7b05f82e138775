use std::path::{Path, PathBuf};

use bitz_contracts::errors::QuestError;

/// Persists uploaded images under a quest-scoped, sequence-numbered
/// name. The sequence index must be the history length observed
/// *before* the matching entry is appended; that makes references
/// deterministic and collision-free within a quest.
#[derive(Debug, Clone)]
pub struct ImageIngest {
    root: PathBuf,
}

impl ImageIngest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn images_dir(&self, quest_id: &str) -> PathBuf {
        self.root.join("images").join(quest_id)
    }

    /// Writes the bytes and returns the stored path. The stable
    /// reference for history entries is the file name component.
    pub fn save(
        &self,
        quest_id: &str,
        sequence_index: usize,
        bytes: &[u8],
    ) -> Result<PathBuf, QuestError> {
        let dir = self.images_dir(quest_id);
        std::fs::create_dir_all(&dir).map_err(QuestError::storage)?;
        let path = dir.join(format!("{sequence_index}_image.jpg"));
        std::fs::write(&path, bytes).map_err(QuestError::storage)?;
        Ok(path)
    }
}

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_under_sequence_numbered_name() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let ingest = ImageIngest::new(temp.path());

        let first = ingest.save("q1", 0, b"aaa")?;
        let second = ingest.save("q1", 1, b"bbb")?;

        assert_eq!(file_name_of(&first), "0_image.jpg");
        assert_eq!(file_name_of(&second), "1_image.jpg");
        assert_eq!(std::fs::read(&first)?, b"aaa");
        assert_eq!(std::fs::read(&second)?, b"bbb");
        Ok(())
    }

    #[test]
    fn directory_creation_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let ingest = ImageIngest::new(temp.path());
        ingest.save("q1", 0, b"aaa")?;
        ingest.save("q1", 1, b"bbb")?;
        assert!(ingest.images_dir("q1").is_dir());
        Ok(())
    }
}
