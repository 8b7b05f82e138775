use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use sha2::{Digest, Sha256};

use bitz_contracts::errors::QuestError;
use bitz_contracts::events::EventWriter;

/// Bounded set of output sizes; the value is the maximum edge in
/// pixels. `Full` means the stored original, untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionClass {
    Icon,
    Thumb,
    Medium,
    Large,
    Full,
}

impl ResolutionClass {
    /// Parsing never fails: an unrecognized label falls back to the
    /// original image rather than an error.
    pub fn parse(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "icon" => Self::Icon,
            "thumb" | "thumbnail" => Self::Thumb,
            "medium" => Self::Medium,
            "large" => Self::Large,
            _ => Self::Full,
        }
    }

    pub fn max_edge(self) -> Option<u32> {
        match self {
            Self::Icon => Some(50),
            Self::Thumb => Some(150),
            Self::Medium => Some(800),
            Self::Large => Some(1600),
            Self::Full => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Icon => "icon",
            Self::Thumb => "thumb",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Full => "full",
        }
    }
}

/// Disk-backed cache of resized image derivatives.
///
/// Entries are keyed by a digest of the source path plus its extension
/// and live under `cache/<class>/`, so the same source at the same
/// class always resolves to the same file. Cache files are written via
/// a temp name and rename; a half-written derivative is never visible.
/// Any processing failure degrades to serving the original.
pub struct ImageDerivativeCache {
    root: PathBuf,
    events: EventWriter,
}

impl ImageDerivativeCache {
    pub fn new(root: impl Into<PathBuf>, events: EventWriter) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }

    /// Resolves the path to serve for `image_path` at `class`. The
    /// original file is never modified.
    pub fn variant(
        &self,
        image_path: &Path,
        class: ResolutionClass,
    ) -> Result<PathBuf, QuestError> {
        if !image_path.is_file() {
            return Err(QuestError::not_found(
                "image",
                image_path.to_string_lossy(),
            ));
        }
        let Some(max_edge) = class.max_edge() else {
            return Ok(image_path.to_path_buf());
        };

        let cache_dir = self.root.join("cache").join(class.label());
        let cached = cache_dir.join(cache_file_name(image_path));
        if cached.is_file() {
            return Ok(cached);
        }

        match self.render(image_path, max_edge, &cache_dir, &cached) {
            Ok(()) => Ok(cached),
            Err(err) => {
                let _ = self.events.emit(
                    "derivative_failed",
                    serde_json::json!({
                        "image": image_path.to_string_lossy().to_string(),
                        "resolution": class.label(),
                        "error": format!("{err:#}"),
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                );
                Ok(image_path.to_path_buf())
            }
        }
    }

    fn render(
        &self,
        image_path: &Path,
        max_edge: u32,
        cache_dir: &Path,
        cached: &Path,
    ) -> anyhow::Result<()> {
        let mut decoder = ImageReader::open(image_path)?
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder.orientation()?;
        let mut img = DynamicImage::from_decoder(decoder)?;
        img.apply_orientation(orientation);

        if img.width() > max_edge || img.height() > max_edge {
            img = img.resize(max_edge, max_edge, FilterType::Lanczos3);
        }

        let format = ImageFormat::from_path(cached).unwrap_or(ImageFormat::Jpeg);
        if format == ImageFormat::Jpeg {
            // JPEG has no alpha channel
            img = DynamicImage::ImageRgb8(img.to_rgb8());
        }

        std::fs::create_dir_all(cache_dir)?;
        // unique temp per render; concurrent creators race only on the
        // final rename, and either winner is a valid derivative
        let tmp = tempfile::Builder::new()
            .prefix(".render-")
            .tempfile_in(cache_dir)?;
        img.save_with_format(tmp.path(), format)?;
        tmp.persist(cached)?;
        Ok(())
    }
}

/// Digest of the source path keeps cache names flat and collision-free
/// without leaking directory structure into file names.
fn cache_file_name(image_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_path.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());
    let ext = image_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "jpg".to_string());
    format!("{digest}.{ext}")
}
