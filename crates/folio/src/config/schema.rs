use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_database_path() -> String {
    dirs::home_dir()
        .map(|h| h.join(".folio").join("data").join("folio.db"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".folio/data/folio.db".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
}

fn default_storage_root() -> String {
    dirs::home_dir()
        .map(|h| h.join(".folio").join("objects"))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".folio/objects".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// Split detector tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_width")]
    pub analysis_width: u32,
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: u8,
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f32,
    #[serde(default = "default_edge_scan_fraction")]
    pub edge_scan_fraction: f32,
    #[serde(default = "default_smoothing_radius")]
    pub smoothing_radius: usize,
    #[serde(default = "default_aspect_landscape")]
    pub aspect_landscape: f32,
    #[serde(default = "default_aspect_borderline")]
    pub aspect_borderline: f32,
    #[serde(default = "default_valley_strong")]
    pub valley_strong: f32,
    #[serde(default = "default_valley_weak")]
    pub valley_weak: f32,
    #[serde(default = "default_content_width")]
    pub content_width: f32,
    #[serde(default)]
    pub gradient_pair: f32,
    #[serde(default = "default_spread_threshold")]
    pub spread_threshold: f32,
}

fn default_analysis_width() -> u32 {
    800
}

fn default_dark_threshold() -> u8 {
    40
}

fn default_coverage_threshold() -> f32 {
    0.30
}

fn default_edge_scan_fraction() -> f32 {
    0.30
}

fn default_smoothing_radius() -> usize {
    30
}

fn default_aspect_landscape() -> f32 {
    1.0
}

fn default_aspect_borderline() -> f32 {
    0.5
}

fn default_valley_strong() -> f32 {
    1.0
}

fn default_valley_weak() -> f32 {
    0.5
}

fn default_content_width() -> f32 {
    0.5
}

fn default_spread_threshold() -> f32 {
    1.5
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis_width: default_analysis_width(),
            dark_threshold: default_dark_threshold(),
            coverage_threshold: default_coverage_threshold(),
            edge_scan_fraction: default_edge_scan_fraction(),
            smoothing_radius: default_smoothing_radius(),
            aspect_landscape: default_aspect_landscape(),
            aspect_borderline: default_aspect_borderline(),
            valley_strong: default_valley_strong(),
            valley_weak: default_valley_weak(),
            content_width: default_content_width(),
            gradient_pair: 0.0,
            spread_threshold: default_spread_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[default]
    Detector,
    Vision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    #[serde(default)]
    pub classifier: ClassifierKind,
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_max_image_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_thumbnail_width() -> u32 {
    300
}

fn default_jpeg_quality() -> u8 {
    90
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            classifier: ClassifierKind::default(),
            thumbnail_width: default_thumbnail_width(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sequential_chunk")]
    pub sequential_chunk: usize,
    #[serde(default = "default_item_delay_ms")]
    pub item_delay_ms: u64,
}

fn default_batch_size() -> usize {
    10
}

fn default_sequential_chunk() -> usize {
    5
}

fn default_item_delay_ms() -> u64 {
    1000
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sequential_chunk: default_sequential_chunk(),
            item_delay_ms: default_item_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_ceiling_usd")]
    pub ceiling_usd: f64,
    #[serde(default)]
    pub estimated_cost_usd: StepCosts,
}

fn default_ceiling_usd() -> f64 {
    10.0
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            ceiling_usd: default_ceiling_usd(),
            estimated_cost_usd: StepCosts::default(),
        }
    }
}

/// Estimated cost of one inference call, charged to the governor before
/// the call is made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCosts {
    #[serde(default = "default_classify_cost")]
    pub classify_spread: f64,
    #[serde(default = "default_ocr_cost")]
    pub ocr: f64,
    #[serde(default = "default_text_cost")]
    pub translate: f64,
    #[serde(default = "default_text_cost")]
    pub summarize: f64,
}

fn default_classify_cost() -> f64 {
    0.002
}

fn default_ocr_cost() -> f64 {
    0.01
}

fn default_text_cost() -> f64 {
    0.005
}

impl Default for StepCosts {
    fn default() -> Self {
        Self {
            classify_spread: default_classify_cost(),
            ocr: default_ocr_cost(),
            translate: default_text_cost(),
            summarize: default_text_cost(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: None,
            timeout_secs: default_timeout_secs(),
            api_key: None,
            api_key_file: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// A config with every tunable at its default.
    pub fn with_defaults() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: default_database_path(),
            storage: StorageConfig::default(),
            analysis: AnalysisConfig::default(),
            ingest: IngestConfig::default(),
            jobs: JobsConfig::default(),
            governor: GovernorConfig::default(),
            inference: InferenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
