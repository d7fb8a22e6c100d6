//! Core configuration
//!
//! All numeric heuristics in the extractor, fallback chain, and matcher are
//! driven from here so they can be tuned without touching the algorithms.
//!
//! ## Configuration Resolution
//!
//! Config is loaded with a two-layer resolution:
//! 1. Check for override in data dir (~/.local/share/ledgermatch/config/core.toml)
//! 2. Fall back to embedded defaults (compiled into binary)

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/core.toml");

/// Primary vision-model connection settings
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Inference server base URL
    pub host: String,
    /// Model name to request
    pub model: String,
    /// Timeout for a single inference call
    pub timeout: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "receipt-vision".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Field-extraction heuristics
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Smallest plausible receipt total
    pub total_min: f64,
    /// Largest plausible receipt total
    pub total_max: f64,
    /// Enable the isolated spurious-leading-digit total correction
    pub leading_digit_fix: bool,
    /// Results below this confidence are rejected by validation
    /// (0.0 disables the floor; callers usually threshold themselves)
    pub confidence_floor: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            total_min: 0.01,
            total_max: 10_000.0,
            leading_digit_fix: true,
            confidence_floor: 0.0,
        }
    }
}

/// Garbled-output detection and fallback-chain settings
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Run the primary vision model at all
    pub use_primary_model: bool,
    /// Allow the classical OCR fallback
    pub enable_classical_ocr: bool,
    /// Allow the handwriting pass (tip recovery)
    pub enable_handwriting_pass: bool,
    /// Minimum unique-token ratio among trailing tokens before the output
    /// counts as decoder looping
    pub min_unique_token_ratio: f64,
    /// How many trailing tokens the repetition check needs before it applies
    pub min_repetition_window: usize,
    /// Totals above this are garbled regardless of other signals
    pub hard_total_ceiling: f64,
    /// Fallback confidence must beat primary by this margin to win outright
    pub confidence_margin: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            use_primary_model: true,
            enable_classical_ocr: true,
            enable_handwriting_pass: false,
            min_unique_token_ratio: 0.30,
            min_repetition_window: 10,
            hard_total_ceiling: 5_000.0,
            confidence_margin: 0.15,
        }
    }
}

/// Matcher weights and threshold
///
/// The weights must sum to 1.0 so totals stay comparable across runs.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub merchant_weight: f64,
    pub amount_weight: f64,
    pub date_weight: f64,
    pub evidence_weight: f64,
    /// Candidates below this total score are discarded
    pub acceptance_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            merchant_weight: 0.4,
            amount_weight: 0.3,
            date_weight: 0.2,
            evidence_weight: 0.1,
            acceptance_threshold: 0.5,
        }
    }
}

impl MatchingConfig {
    /// Weights must form a convex combination
    pub fn validate(&self) -> Result<()> {
        let sum =
            self.merchant_weight + self.amount_weight + self.date_weight + self.evidence_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "matching weights must sum to 1.0, got {:.4}",
                sum
            )));
        }
        Ok(())
    }
}

/// Harvester scheduling settings
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Per-source time budget
    pub source_timeout: Duration,
    /// Per-candidate extraction budget inside a match run
    pub candidate_budget: Duration,
    /// Days around the transaction date to search
    pub date_window_days: i64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(20),
            candidate_budget: Duration::from_secs(45),
            date_window_days: 5,
        }
    }
}

/// Top-level configuration injected into the extractor, matcher, and pipeline
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub vision: VisionConfig,
    pub extraction: ExtractionConfig,
    pub fallback: FallbackConfig,
    pub matching: MatchingConfig,
    pub harvest: HarvestConfig,
}

impl CoreConfig {
    /// Load config with two-layer resolution (override file, then embedded)
    pub fn load() -> Result<Self> {
        if let Some(path) = Self::override_path() {
            if path.exists() {
                let content = fs::read_to_string(&path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                tracing::info!(path = %path.display(), "Loading config override");
                return Self::from_toml(&content);
            }
        }
        Self::from_toml(DEFAULT_CONFIG)
    }

    /// Parse a config from TOML text; missing sections keep their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid config: {}", e)))?;
        let config = Self::from_raw(raw);
        config.matching.validate()?;
        Ok(config)
    }

    /// Platform override location (~/.local/share/ledgermatch/config/core.toml)
    pub fn override_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("ledgermatch").join("config").join("core.toml"))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let mut config = Self::default();

        if let Some(v) = raw.vision {
            if let Some(host) = v.host {
                config.vision.host = host;
            }
            if let Some(model) = v.model {
                config.vision.model = model;
            }
            if let Some(secs) = v.timeout_secs {
                config.vision.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(e) = raw.extraction {
            if let Some(v) = e.total_min {
                config.extraction.total_min = v;
            }
            if let Some(v) = e.total_max {
                config.extraction.total_max = v;
            }
            if let Some(v) = e.leading_digit_fix {
                config.extraction.leading_digit_fix = v;
            }
            if let Some(v) = e.confidence_floor {
                config.extraction.confidence_floor = v;
            }
        }
        if let Some(f) = raw.fallback {
            if let Some(v) = f.use_primary_model {
                config.fallback.use_primary_model = v;
            }
            if let Some(v) = f.enable_classical_ocr {
                config.fallback.enable_classical_ocr = v;
            }
            if let Some(v) = f.enable_handwriting_pass {
                config.fallback.enable_handwriting_pass = v;
            }
            if let Some(v) = f.min_unique_token_ratio {
                config.fallback.min_unique_token_ratio = v;
            }
            if let Some(v) = f.min_repetition_window {
                config.fallback.min_repetition_window = v;
            }
            if let Some(v) = f.hard_total_ceiling {
                config.fallback.hard_total_ceiling = v;
            }
            if let Some(v) = f.confidence_margin {
                config.fallback.confidence_margin = v;
            }
        }
        if let Some(m) = raw.matching {
            if let Some(v) = m.merchant_weight {
                config.matching.merchant_weight = v;
            }
            if let Some(v) = m.amount_weight {
                config.matching.amount_weight = v;
            }
            if let Some(v) = m.date_weight {
                config.matching.date_weight = v;
            }
            if let Some(v) = m.evidence_weight {
                config.matching.evidence_weight = v;
            }
            if let Some(v) = m.acceptance_threshold {
                config.matching.acceptance_threshold = v;
            }
        }
        if let Some(h) = raw.harvest {
            if let Some(secs) = h.source_timeout_secs {
                config.harvest.source_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = h.candidate_budget_secs {
                config.harvest.candidate_budget = Duration::from_secs(secs);
            }
            if let Some(days) = h.date_window_days {
                config.harvest.date_window_days = days;
            }
        }

        config
    }
}

// Raw TOML shapes; every field optional so partial override files work

#[derive(Debug, Deserialize)]
struct RawConfig {
    vision: Option<RawVision>,
    extraction: Option<RawExtraction>,
    fallback: Option<RawFallback>,
    matching: Option<RawMatching>,
    harvest: Option<RawHarvest>,
}

#[derive(Debug, Deserialize)]
struct RawVision {
    host: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawExtraction {
    total_min: Option<f64>,
    total_max: Option<f64>,
    leading_digit_fix: Option<bool>,
    confidence_floor: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawFallback {
    use_primary_model: Option<bool>,
    enable_classical_ocr: Option<bool>,
    enable_handwriting_pass: Option<bool>,
    min_unique_token_ratio: Option<f64>,
    min_repetition_window: Option<usize>,
    hard_total_ceiling: Option<f64>,
    confidence_margin: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawMatching {
    merchant_weight: Option<f64>,
    amount_weight: Option<f64>,
    date_weight: Option<f64>,
    evidence_weight: Option<f64>,
    acceptance_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawHarvest {
    source_timeout_secs: Option<u64>,
    candidate_budget_secs: Option<u64>,
    date_window_days: Option<i64>,
}
