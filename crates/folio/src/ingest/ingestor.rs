use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::Serialize;
use tracing::Instrument;

use super::classifier::{ClassifyInput, SpreadClassifier};
use super::source::ImageSource;
use crate::config::IngestConfig;
use crate::db::page_repo::{self, NewPage, PageRow, PageSide};
use crate::db::{book_repo, Database};
use crate::error::{FolioError, IngestError};
use crate::storage::ObjectStore;

/// Each half of a cut spread must keep at least this share of the width.
const MIN_HALF_FRACTION: f32 = 0.20;

#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Fetched through the configured [`ImageSource`].
    Url(String),
    /// Already in memory, e.g. an upload.
    Bytes { name: String, bytes: Vec<u8> },
}

impl ImageInput {
    pub fn name(&self) -> String {
        match self {
            ImageInput::Url(url) => crate::sanitize::url_name(url),
            ImageInput::Bytes { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub max_image_bytes: usize,
    pub thumbnail_width: u32,
    pub jpeg_quality: u8,
}

impl From<&IngestConfig> for IngestSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_image_bytes: config.max_image_bytes as usize,
            thumbnail_width: config.thumbnail_width,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedImage {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub pages: Vec<PageRow>,
    pub skipped: Vec<SkippedImage>,
    /// Inputs that were cut into two pages.
    pub spreads: u32,
}

/// Turns uploaded or fetched scans into page records, cutting two-page
/// spreads into left and right pages.
pub struct Ingestor {
    db: Database,
    store: Arc<dyn ObjectStore>,
    source: Arc<dyn ImageSource>,
    classifier: Arc<dyn SpreadClassifier>,
    settings: IngestSettings,
}

impl Ingestor {
    pub fn new(
        db: Database,
        store: Arc<dyn ObjectStore>,
        source: Arc<dyn ImageSource>,
        classifier: Arc<dyn SpreadClassifier>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            db,
            store,
            source,
            classifier,
            settings,
        }
    }

    /// Ingests `inputs` in order and appends the resulting pages to the
    /// book in a single transaction.
    ///
    /// Per-image problems (fetch, size, decode, storage) become entries in
    /// [`IngestReport::skipped`]; only database failures abort the call.
    pub async fn ingest(
        &self,
        book_id: &str,
        inputs: Vec<ImageInput>,
    ) -> Result<IngestReport, FolioError> {
        book_repo::require(&self.db, book_id)?;

        let span = tracing::info_span!("ingest", book_id, images = inputs.len());
        self.ingest_all(book_id, inputs).instrument(span).await
    }

    async fn ingest_all(
        &self,
        book_id: &str,
        inputs: Vec<ImageInput>,
    ) -> Result<IngestReport, FolioError> {
        let mut report = IngestReport::default();
        let mut pending = Vec::new();
        for input in inputs {
            let name = input.name();
            match self.prepare(book_id, input).await {
                Ok((pages, was_cut)) => {
                    if was_cut {
                        report.spreads += 1;
                    }
                    pending.extend(pages);
                }
                Err(e) => {
                    tracing::warn!(image = %name, error = %e, "skipping image");
                    report.skipped.push(SkippedImage {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.pages = page_repo::append_pages(&self.db, book_id, &pending)?;
        book_repo::refresh_counters(&self.db, book_id)?;

        tracing::info!(
            pages = report.pages.len(),
            spreads = report.spreads,
            skipped = report.skipped.len(),
            "ingest finished"
        );
        Ok(report)
    }

    async fn prepare(
        &self,
        book_id: &str,
        input: ImageInput,
    ) -> Result<(Vec<NewPage>, bool), IngestError> {
        let name = input.name();
        let (bytes, content_type) = match input {
            ImageInput::Url(url) => {
                let fetched = self.source.fetch(&url).await?;
                (fetched.bytes, fetched.content_type)
            }
            ImageInput::Bytes { name, bytes } => {
                let guessed = mime_guess::from_path(&name).first().map(|m| m.to_string());
                (bytes, guessed)
            }
        };
        if bytes.len() > self.settings.max_image_bytes {
            return Err(IngestError::TooLarge {
                name,
                size: bytes.len(),
                limit: self.settings.max_image_bytes,
            });
        }

        let image = image::load_from_memory(&bytes).map_err(|e| IngestError::Decode {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        let content_type = content_type
            .filter(|ct| ct.starts_with("image/"))
            .or_else(|| {
                image::guess_format(&bytes)
                    .ok()
                    .map(|f| f.to_mime_type().to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let analysis = self
            .classifier
            .classify(ClassifyInput {
                name: &name,
                image: &image,
                bytes: &bytes,
                content_type: &content_type,
            })
            .await;

        let prefix = format!("books/{}/{}", book_id, uuid::Uuid::new_v4());
        let original_url = self
            .store
            .put(&format!("{}/original", prefix), &bytes, &content_type)?;
        let confidence = Some(analysis.confidence.as_str().to_string());

        if analysis.is_spread {
            let cut_x = analysis.cut_column(image.width());
            match slice_spread(&image, cut_x) {
                Ok((left, right)) => {
                    let mut pages = Vec::with_capacity(2);
                    for (side, half) in [(PageSide::Left, left), (PageSide::Right, right)] {
                        let jpeg = encode_jpeg(&half, self.settings.jpeg_quality)?;
                        let image_url = self.store.put(
                            &format!("{}/{}.jpg", prefix, side.as_str()),
                            &jpeg,
                            "image/jpeg",
                        )?;
                        let thumbnail_url = self.put_thumbnail(&prefix, side.as_str(), &half)?;
                        pages.push(NewPage {
                            image_url,
                            thumbnail_url: Some(thumbnail_url),
                            source_image_url: Some(original_url.clone()),
                            side: Some(side),
                            split_confidence: confidence.clone(),
                        });
                    }
                    tracing::debug!(image = %name, cut_x, confidence = %analysis.confidence, "cut spread");
                    return Ok((pages, true));
                }
                Err(e) => {
                    tracing::warn!(image = %name, error = %e, "keeping spread as a single page");
                }
            }
        }

        let thumbnail_url = self.put_thumbnail(&prefix, "page", &image)?;
        Ok((
            vec![NewPage {
                image_url: original_url,
                thumbnail_url: Some(thumbnail_url),
                source_image_url: None,
                side: None,
                split_confidence: confidence,
            }],
            false,
        ))
    }

    fn put_thumbnail(
        &self,
        prefix: &str,
        label: &str,
        image: &DynamicImage,
    ) -> Result<String, IngestError> {
        let thumb = thumbnail(image, self.settings.thumbnail_width);
        let jpeg = encode_jpeg(&thumb, self.settings.jpeg_quality)?;
        Ok(self.store.put(
            &format!("{}/{}_thumb.jpg", prefix, label),
            &jpeg,
            "image/jpeg",
        )?)
    }
}

/// Cuts a spread at `cut_x` into (left, right).
///
/// Fails when either half would be narrower than a fifth of the image.
pub fn slice_spread(
    image: &DynamicImage,
    cut_x: u32,
) -> Result<(DynamicImage, DynamicImage), IngestError> {
    let (width, height) = image.dimensions();
    let min_half = ((width as f32 * MIN_HALF_FRACTION).ceil() as u32).max(1);
    if cut_x < min_half || width.saturating_sub(cut_x) < min_half {
        return Err(IngestError::Slice { cut_x, width });
    }
    let left = image.crop_imm(0, 0, cut_x, height);
    let right = image.crop_imm(cut_x, 0, width - cut_x, height);
    Ok((left, right))
}

/// Downscales to `max_width`, keeping the aspect ratio. Never upscales.
pub fn thumbnail(image: &DynamicImage, max_width: u32) -> DynamicImage {
    if image.width() <= max_width {
        return image.clone();
    }
    let height = ((image.height() as u64 * max_width as u64) / image.width() as u64).max(1) as u32;
    image.resize_exact(max_width, height, FilterType::Triangle)
}

pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, IngestError> {
    let rgb = image.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&rgb)
        .map_err(|e| IngestError::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
