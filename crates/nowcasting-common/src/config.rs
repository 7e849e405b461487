//! Dataset preparation configuration, loaded once from YAML and validated
//! before any I/O.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{NowcastingError, NowcastingResult};
use crate::retry::RetryPolicy;
use crate::time::TimeWindow;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub process: ProcessConfig,
    #[serde(default)]
    pub split: SplitConfig,
    pub input_data: InputDataConfig,
    pub output: OutputConfig,
}

impl Configuration {
    /// Load and validate a YAML configuration file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> NowcastingResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NowcastingError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> NowcastingResult<Self> {
        let config: Configuration = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field rule. Violations fail with `InvalidConfiguration`.
    pub fn validate(&self) -> NowcastingResult<()> {
        self.process.validate()?;
        self.split.validate()?;
        self.input_data.validate()?;
        self.output.validate()?;
        Ok(())
    }

    /// Number of batches to produce for a split.
    pub fn n_batches(&self, split: SplitName) -> usize {
        match split {
            SplitName::Train => self.process.n_train_batches,
            SplitName::Validation => self.process.n_validation_batches,
            SplitName::Test => self.process.n_test_batches,
        }
    }
}

// ============================================================================
// Process
// ============================================================================

/// Batch production parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Examples per batch
    pub batch_size: usize,

    /// Base seed for every random draw
    #[serde(default)]
    pub seed: u64,

    /// Redraws allowed per example slot after a recoverable failure
    #[serde(default = "default_max_example_retries")]
    pub max_example_retries: u32,

    /// Worker tasks per split
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    #[serde(default)]
    pub n_train_batches: usize,

    #[serde(default)]
    pub n_validation_batches: usize,

    #[serde(default)]
    pub n_test_batches: usize,

    /// Retry policy for transient store reads
    #[serde(default)]
    pub read_retry: RetryPolicy,
}

fn default_max_example_retries() -> u32 {
    5
}

fn default_num_workers() -> usize {
    1
}

impl ProcessConfig {
    fn validate(&self) -> NowcastingResult<()> {
        if self.batch_size == 0 {
            return Err(NowcastingError::config("process.batch_size must be > 0"));
        }
        if self.num_workers == 0 {
            return Err(NowcastingError::config("process.num_workers must be > 0"));
        }
        Ok(())
    }
}

// ============================================================================
// Split
// ============================================================================

/// How timestamps are divided between train, validation and test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitMethod {
    Same,
    Day,
    DayRandom,
    Week,
    WeekRandom,
    Year,
}

impl SplitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Same => "same",
            Self::Day => "day",
            Self::DayRandom => "day_random",
            Self::Week => "week",
            Self::WeekRandom => "week_random",
            Self::Year => "year",
        }
    }
}

impl FromStr for SplitMethod {
    type Err = NowcastingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "same" => Ok(Self::Same),
            "day" => Ok(Self::Day),
            "day_random" => Ok(Self::DayRandom),
            "week" => Ok(Self::Week),
            "week_random" => Ok(Self::WeekRandom),
            "year" => Ok(Self::Year),
            _ => Err(NowcastingError::UnsupportedSplitMethod(s.to_string())),
        }
    }
}

impl std::fmt::Display for SplitMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One of the three output splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitName {
    Train,
    Validation,
    Test,
}

impl SplitName {
    pub const ALL: [SplitName; 3] = [SplitName::Train, SplitName::Validation, SplitName::Test];

    /// Directory name under the output root.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }

    /// Small integer mixed into per-batch seeds.
    pub fn index(&self) -> u64 {
        match self {
            Self::Train => 0,
            Self::Validation => 1,
            Self::Test => 2,
        }
    }
}

impl FromStr for SplitName {
    type Err = NowcastingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Self::Train),
            "validation" => Ok(Self::Validation),
            "test" => Ok(Self::Test),
            _ => Err(NowcastingError::InvalidArgument(format!("unknown split: {}", s))),
        }
    }
}

impl std::fmt::Display for SplitName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Explicit year -> split mapping for [`SplitMethod::Year`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearSplit {
    pub train: Vec<i32>,
    pub validation: Vec<i32>,
    pub test: Vec<i32>,
}

impl Default for YearSplit {
    fn default() -> Self {
        Self {
            train: (2015..=2019).collect(),
            validation: vec![2020],
            test: vec![2021],
        }
    }
}

impl YearSplit {
    /// The split a year belongs to, if mapped.
    pub fn split_for(&self, year: i32) -> Option<SplitName> {
        if self.train.contains(&year) {
            Some(SplitName::Train)
        } else if self.validation.contains(&year) {
            Some(SplitName::Validation)
        } else if self.test.contains(&year) {
            Some(SplitName::Test)
        } else {
            None
        }
    }
}

/// Split section of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// One of `same`, `day`, `day_random`, `week`, `week_random`, `year`
    #[serde(default = "default_split_method")]
    pub method: String,

    /// Train/validation/test proportions
    #[serde(default = "default_ratios")]
    pub ratios: [u32; 3],

    #[serde(default)]
    pub years: YearSplit,
}

fn default_split_method() -> String {
    "day".to_string()
}

fn default_ratios() -> [u32; 3] {
    [3, 1, 1]
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            method: default_split_method(),
            ratios: default_ratios(),
            years: YearSplit::default(),
        }
    }
}

impl SplitConfig {
    pub fn method(&self) -> NowcastingResult<SplitMethod> {
        self.method.parse()
    }

    fn validate(&self) -> NowcastingResult<()> {
        self.method().map_err(|e| NowcastingError::config(e.to_string()))?;
        if self.ratios.iter().any(|r| *r == 0) {
            return Err(NowcastingError::config(format!(
                "split.ratios must all be > 0, got {:?}",
                self.ratios
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Input data
// ============================================================================

/// Per-source settings plus the shared history/forecast spans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDataConfig {
    #[serde(default = "default_history_minutes")]
    pub history_minutes: i64,

    #[serde(default = "default_forecast_minutes")]
    pub forecast_minutes: i64,

    #[serde(default)]
    pub satellite: Option<GridSourceConfig>,

    #[serde(default)]
    pub nwp: Option<GridSourceConfig>,

    #[serde(default)]
    pub pv: Option<PointSourceConfig>,

    #[serde(default)]
    pub gsp: Option<PointSourceConfig>,

    #[serde(default)]
    pub optical_flow: Option<OpticalFlowConfig>,
}

fn default_history_minutes() -> i64 {
    30
}

fn default_forecast_minutes() -> i64 {
    60
}

fn default_sample_period() -> i64 {
    5
}

fn default_image_size() -> usize {
    64
}

fn default_meters_per_pixel() -> f64 {
    2000.0
}

impl InputDataConfig {
    fn validate(&self) -> NowcastingResult<()> {
        if self.satellite.is_none() && self.nwp.is_none() && self.pv.is_none() && self.gsp.is_none() {
            return Err(NowcastingError::config(
                "input_data must configure at least one of satellite, nwp, pv, gsp",
            ));
        }

        for (name, grid) in [("satellite", &self.satellite), ("nwp", &self.nwp)] {
            if let Some(grid) = grid {
                grid.validate(name, self)?;
            }
        }
        for (name, point) in [("pv", &self.pv), ("gsp", &self.gsp)] {
            if let Some(point) = point {
                point.validate(name, self)?;
            }
        }

        if let Some(flow) = &self.optical_flow {
            let satellite = self.satellite.as_ref().ok_or_else(|| {
                NowcastingError::config("input_data.optical_flow requires input_data.satellite")
            })?;
            flow.validate(self, satellite)?;
        }
        Ok(())
    }
}

/// A gridded image source (satellite or NWP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSourceConfig {
    /// Path to the source Zarr array
    pub zarr_path: PathBuf,

    /// Channel subset, in output order
    pub channels: Vec<String>,

    #[serde(default = "default_image_size")]
    pub image_size_pixels: usize,

    #[serde(default = "default_meters_per_pixel")]
    pub meters_per_pixel: f64,

    #[serde(default = "default_sample_period")]
    pub sample_period_minutes: i64,

    /// Overrides `input_data.history_minutes`
    #[serde(default)]
    pub history_minutes: Option<i64>,

    /// Overrides `input_data.forecast_minutes`
    #[serde(default)]
    pub forecast_minutes: Option<i64>,
}

impl GridSourceConfig {
    /// The sampling window with per-source overrides applied.
    pub fn window(&self, defaults: &InputDataConfig) -> NowcastingResult<TimeWindow> {
        TimeWindow::new(
            self.history_minutes.unwrap_or(defaults.history_minutes),
            self.forecast_minutes.unwrap_or(defaults.forecast_minutes),
            self.sample_period_minutes,
        )
    }

    fn validate(&self, name: &str, defaults: &InputDataConfig) -> NowcastingResult<()> {
        self.window(defaults)
            .map_err(|e| NowcastingError::config(format!("input_data.{}: {}", name, e)))?;
        validate_image(name, self.image_size_pixels, self.meters_per_pixel)?;
        if self.channels.is_empty() {
            return Err(NowcastingError::config(format!(
                "input_data.{}.channels must not be empty",
                name
            )));
        }
        Ok(())
    }
}

/// A station source (PV systems or grid supply points).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSourceConfig {
    /// Path to the source Zarr array
    pub zarr_path: PathBuf,

    /// Entities taken per example, nearest first
    #[serde(default = "default_entities")]
    pub n_entities_per_example: usize,

    /// Side of the square search area, with `meters_per_pixel`
    #[serde(default = "default_image_size")]
    pub image_size_pixels: usize,

    #[serde(default = "default_meters_per_pixel")]
    pub meters_per_pixel: f64,

    #[serde(default = "default_sample_period")]
    pub sample_period_minutes: i64,

    #[serde(default)]
    pub history_minutes: Option<i64>,

    #[serde(default)]
    pub forecast_minutes: Option<i64>,
}

fn default_entities() -> usize {
    1
}

impl PointSourceConfig {
    /// The sampling window with per-source overrides applied.
    pub fn window(&self, defaults: &InputDataConfig) -> NowcastingResult<TimeWindow> {
        TimeWindow::new(
            self.history_minutes.unwrap_or(defaults.history_minutes),
            self.forecast_minutes.unwrap_or(defaults.forecast_minutes),
            self.sample_period_minutes,
        )
    }

    /// Maximum distance from the center for a selected entity.
    pub fn search_radius_m(&self) -> f64 {
        self.image_size_pixels as f64 * self.meters_per_pixel / 2.0
    }

    fn validate(&self, name: &str, defaults: &InputDataConfig) -> NowcastingResult<()> {
        self.window(defaults)
            .map_err(|e| NowcastingError::config(format!("input_data.{}: {}", name, e)))?;
        validate_image(name, self.image_size_pixels, self.meters_per_pixel)?;
        if self.n_entities_per_example == 0 {
            return Err(NowcastingError::config(format!(
                "input_data.{}.n_entities_per_example must be > 0",
                name
            )));
        }
        Ok(())
    }
}

fn validate_image(name: &str, image_size_pixels: usize, meters_per_pixel: f64) -> NowcastingResult<()> {
    if image_size_pixels == 0 || image_size_pixels % 2 != 0 {
        return Err(NowcastingError::config(format!(
            "input_data.{}.image_size_pixels must be positive and even, got {}",
            name, image_size_pixels
        )));
    }
    if !(meters_per_pixel > 0.0) || !meters_per_pixel.is_finite() {
        return Err(NowcastingError::config(format!(
            "input_data.{}.meters_per_pixel must be > 0, got {}",
            name, meters_per_pixel
        )));
    }
    Ok(())
}

/// The derived optical-flow source, computed from satellite frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticalFlowConfig {
    /// Steps between the two frames the flow is estimated from
    #[serde(default = "default_previous_timestep")]
    pub previous_timestep_for_flow: usize,

    /// Output crop side
    #[serde(default = "default_flow_image_size")]
    pub image_size_pixels: usize,

    /// Half-width of the Lucas-Kanade window
    #[serde(default = "default_flow_window_radius")]
    pub window_radius: usize,

    /// Overrides `input_data.forecast_minutes`
    #[serde(default)]
    pub forecast_minutes: Option<i64>,
}

fn default_previous_timestep() -> usize {
    1
}

fn default_flow_image_size() -> usize {
    32
}

fn default_flow_window_radius() -> usize {
    3
}

impl OpticalFlowConfig {
    /// Forecast window at the satellite's sample period.
    pub fn window(&self, defaults: &InputDataConfig, satellite: &GridSourceConfig) -> NowcastingResult<TimeWindow> {
        let sat = satellite.window(defaults)?;
        TimeWindow::new(
            sat.history_minutes,
            self.forecast_minutes.unwrap_or(defaults.forecast_minutes),
            satellite.sample_period_minutes,
        )
    }

    fn validate(&self, defaults: &InputDataConfig, satellite: &GridSourceConfig) -> NowcastingResult<()> {
        let window = self
            .window(defaults, satellite)
            .map_err(|e| NowcastingError::config(format!("input_data.optical_flow: {}", e)))?;
        if self.previous_timestep_for_flow == 0 {
            return Err(NowcastingError::config(
                "input_data.optical_flow.previous_timestep_for_flow must be >= 1",
            ));
        }
        if self.previous_timestep_for_flow > window.history_steps() {
            return Err(NowcastingError::config(format!(
                "input_data.optical_flow.previous_timestep_for_flow ({}) exceeds satellite history steps ({})",
                self.previous_timestep_for_flow,
                window.history_steps()
            )));
        }
        if window.forecast_steps() == 0 {
            return Err(NowcastingError::config(
                "input_data.optical_flow needs at least one forecast step",
            ));
        }
        if self.image_size_pixels == 0 || self.image_size_pixels % 2 != 0 {
            return Err(NowcastingError::config(format!(
                "input_data.optical_flow.image_size_pixels must be positive and even, got {}",
                self.image_size_pixels
            )));
        }
        if self.image_size_pixels > satellite.image_size_pixels {
            return Err(NowcastingError::config(format!(
                "input_data.optical_flow.image_size_pixels ({}) exceeds the satellite crop ({})",
                self.image_size_pixels, satellite.image_size_pixels
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Output
// ============================================================================

/// Where and how batches are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root directory for `train/`, `validation/`, `test/`
    pub local_path: PathBuf,

    /// Blosc-Zstd level (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u8,

    /// Remote destination; batches stay local when absent
    #[serde(default)]
    pub upload: Option<UploadConfig>,

    #[serde(default)]
    pub upload_retry: RetryPolicy,
}

fn default_compression_level() -> u8 {
    1
}

impl OutputConfig {
    fn validate(&self) -> NowcastingResult<()> {
        if self.compression_level > 9 {
            return Err(NowcastingError::config(format!(
                "output.compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if let Some(upload) = &self.upload {
            if upload.bucket.is_empty() {
                return Err(NowcastingError::config("output.upload.bucket must not be empty"));
            }
        }
        Ok(())
    }
}

/// S3-compatible upload target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// S3/MinIO endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// AWS region (use "us-east-1" for MinIO)
    #[serde(default = "default_region")]
    pub region: String,
    /// Allow HTTP (for local MinIO)
    #[serde(default)]
    pub allow_http: bool,
    /// Key prefix under which split directories are written
    #[serde(default)]
    pub prefix: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
process:
  batch_size: 32
  seed: 1234
  num_workers: 2
  n_train_batches: 4
  n_validation_batches: 1
  n_test_batches: 1
split:
  method: day
  ratios: [3, 1, 1]
input_data:
  history_minutes: 30
  forecast_minutes: 60
  satellite:
    zarr_path: /data/sat.zarr
    channels: [HRV, IR_016]
    image_size_pixels: 64
    sample_period_minutes: 5
  gsp:
    zarr_path: /data/gsp.zarr
    n_entities_per_example: 4
    sample_period_minutes: 30
  optical_flow:
    previous_timestep_for_flow: 1
    image_size_pixels: 32
output:
  local_path: /tmp/prepared
"#;

    fn parse(yaml: &str) -> NowcastingResult<Configuration> {
        Configuration::from_yaml_str(yaml)
    }

    #[test]
    fn test_parses_and_applies_defaults() {
        let config = parse(YAML).unwrap();

        assert_eq!(config.process.batch_size, 32);
        assert_eq!(config.process.max_example_retries, 5);
        assert_eq!(config.split.method().unwrap(), SplitMethod::Day);
        assert_eq!(config.output.compression_level, 1);
        assert_eq!(config.output.upload_retry, RetryPolicy::default());
        assert_eq!(config.n_batches(SplitName::Train), 4);

        let gsp = config.input_data.gsp.as_ref().unwrap();
        let window = gsp.window(&config.input_data).unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(gsp.search_radius_m(), 64_000.0);
    }

    #[test]
    fn test_source_overrides_window() {
        let yaml = YAML.replace(
            "    sample_period_minutes: 30\n",
            "    sample_period_minutes: 30\n    history_minutes: 60\n",
        );
        let config = parse(&yaml).unwrap();
        let gsp = config.input_data.gsp.as_ref().unwrap();
        assert_eq!(gsp.window(&config.input_data).unwrap().history_steps(), 2);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let yaml = YAML.replace("batch_size: 32", "batch_size: 0");
        assert!(matches!(parse(&yaml), Err(NowcastingError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_rejects_misaligned_history() {
        let yaml = YAML.replace("history_minutes: 30", "history_minutes: 20");
        // 20 is a multiple of 5 (satellite) but not of 30 (gsp).
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_rejects_odd_image_size() {
        let yaml = YAML.replace("image_size_pixels: 64", "image_size_pixels: 63");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_rejects_unknown_split_method() {
        let yaml = YAML.replace("method: day", "method: fortnight");
        assert!(matches!(parse(&yaml), Err(NowcastingError::InvalidConfiguration(_))));
        assert!(matches!(
            "fortnight".parse::<SplitMethod>(),
            Err(NowcastingError::UnsupportedSplitMethod(_))
        ));
    }

    #[test]
    fn test_rejects_zero_ratio() {
        let yaml = YAML.replace("ratios: [3, 1, 1]", "ratios: [3, 0, 1]");
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_optical_flow_requires_satellite_history() {
        let yaml = YAML.replace("previous_timestep_for_flow: 1", "previous_timestep_for_flow: 7");
        // Satellite history is 30 / 5 = 6 steps.
        assert!(parse(&yaml).is_err());
    }

    #[test]
    fn test_rejects_empty_sources() {
        let yaml = r#"
process:
  batch_size: 4
input_data: {}
output:
  local_path: /tmp/out
"#;
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = Configuration::from_yaml_file(&path).unwrap();
        assert_eq!(config.process.seed, 1234);

        assert!(Configuration::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_year_split_mapping() {
        let years = YearSplit::default();
        assert_eq!(years.split_for(2017), Some(SplitName::Train));
        assert_eq!(years.split_for(2020), Some(SplitName::Validation));
        assert_eq!(years.split_for(2021), Some(SplitName::Test));
        assert_eq!(years.split_for(2014), None);
    }
}
