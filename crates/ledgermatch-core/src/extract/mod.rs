//! Receipt field extraction
//!
//! The extractor runs the primary vision-to-text model, judges its output
//! with the garbled-output detector, and walks the fallback chain (classical
//! OCR, then an optional handwriting pass for tips) as far as the
//! configuration allows. Errors never escape [`FieldExtractor::extract`]:
//! every failure mode is an `ExtractionResult` the caller can inspect or
//! skip.
//!
//! # Architecture
//!
//! - `VisionBackend` trait + `VisionClient` enum: the primary model
//! - `OcrClient`: classical fallback engines
//! - `garble`: pure verdict/decision/selection functions
//! - `fields`: pure line-mining heuristics shared by every engine

pub mod fields;
pub mod garble;
pub mod mock;
pub mod ocr;
pub mod parsing;
pub mod vision;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::alias::AliasHandle;
use crate::config::CoreConfig;
use crate::models::{ExtractionIssue, ExtractionMethod, ExtractionResult};
use crate::normalize::{normalize_date_detailed, normalize_merchant_with};
use crate::prompts::PromptId;

use fields::MinedFields;
use garble::{FallbackAction, Verdict};
use mock::MockVisionBackend;
use ocr::OcrClient;
use parsing::ModelFields;
use vision::{VisionBackend, VisionClient};

pub use mock::MockOcrEngine;
pub use vision::HttpVisionBackend;

/// Field extractor with cascading fallback
///
/// Construct once and share: the vision client and OCR engines hold their
/// connections/configuration behind cheap clones, and results are cached per
/// batch keyed by content hash and alias-table version.
pub struct FieldExtractor {
    vision: Option<VisionClient>,
    classical: Option<OcrClient>,
    aliases: AliasHandle,
    config: CoreConfig,
    cache: Mutex<HashMap<String, ExtractionResult>>,
}

impl FieldExtractor {
    /// Extractor with no engines; every extraction fails softly
    pub fn new(config: CoreConfig, aliases: AliasHandle) -> Self {
        Self {
            vision: None,
            classical: None,
            aliases,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build from config: HTTP vision backend plus the default OCR engine
    pub fn from_config(config: CoreConfig, aliases: AliasHandle) -> Self {
        let vision = VisionClient::http(&config.vision);
        Self::new(config, aliases)
            .with_vision(vision)
            .with_classical_ocr(OcrClient::default())
    }

    pub fn with_vision(mut self, client: VisionClient) -> Self {
        self.vision = Some(client);
        self
    }

    pub fn with_mock_vision(self, backend: MockVisionBackend) -> Self {
        self.with_vision(VisionClient::mock(backend))
    }

    pub fn with_classical_ocr(mut self, client: OcrClient) -> Self {
        self.classical = Some(client);
        self
    }

    /// Drop cached results (call between batches)
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Extract structured fields from receipt image bytes
    ///
    /// Never returns an error: input problems, engine unavailability, and
    /// total extraction failure all come back as a result with
    /// `success = false`.
    pub async fn extract(&self, image: &[u8]) -> ExtractionResult {
        let key = self.cache_key(image);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                debug!(key = %&key[..12], "Extraction cache hit");
                return hit.clone();
            }
        }

        let result = self.extract_uncached(image).await;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, result.clone());
        }
        result
    }

    /// Extract from a receipt image file on disk
    pub async fn extract_file(&self, path: &Path) -> ExtractionResult {
        match std::fs::read(path) {
            Ok(bytes) => self.extract(&bytes).await,
            Err(e) => ExtractionResult::failed(format!(
                "cannot read receipt image {}: {}",
                path.display(),
                e
            )),
        }
    }

    /// Extract fields from already-textual evidence (message bodies, HTML)
    ///
    /// No engine runs; the line heuristics mine the text directly.
    pub fn extract_from_text(&self, text: &str) -> ExtractionResult {
        let table = self.aliases.current();
        let mined = fields::mine_fields(text, &table, &self.config.extraction);
        self.finalize(mined, ExtractionMethod::Primary)
    }

    async fn extract_uncached(&self, image: &[u8]) -> ExtractionResult {
        if image.is_empty() {
            return ExtractionResult::failed("empty image payload");
        }

        let primary = self.run_primary(image).await;

        match primary {
            Some((raw, result)) => {
                let verdict = garble::assess(&raw, &result, &self.config.fallback);
                let action = garble::next_action(
                    &verdict,
                    ExtractionMethod::Primary,
                    &result,
                    &self.config.fallback,
                );
                match action {
                    FallbackAction::Accept => result,
                    FallbackAction::TryHandwriting => self.merge_tip(image, result).await,
                    FallbackAction::TryClassicalOcr => {
                        let reason = match verdict {
                            Verdict::Rejected(reason) => reason,
                            Verdict::Trusted => unreachable!("classical OCR only after rejection"),
                        };
                        warn!(reason = %reason, "Primary extraction rejected, trying classical OCR");
                        let fallback = self.run_classical(image).await;
                        let selected = garble::select_result(
                            result,
                            fallback,
                            reason,
                            &self.config.extraction,
                            &self.config.fallback,
                        );
                        self.maybe_recover_tip(image, selected).await
                    }
                    FallbackAction::GiveUp => result,
                }
            }
            // Primary disabled, absent, or down: silently fall through
            None => {
                let fallback = self.run_classical(image).await;
                if fallback.success {
                    self.maybe_recover_tip(image, fallback).await
                } else {
                    ExtractionResult::failed(
                        fallback
                            .error
                            .unwrap_or_else(|| "no extraction method available".to_string()),
                    )
                }
            }
        }
    }

    /// Run the primary model, returning its raw output and parsed result
    async fn run_primary(&self, image: &[u8]) -> Option<(String, ExtractionResult)> {
        if !self.config.fallback.use_primary_model {
            return None;
        }
        let vision = self.vision.as_ref()?;

        match vision.generate(image, PromptId::ParseReceipt).await {
            Ok(raw) => {
                let result = self.result_from_output(&raw, ExtractionMethod::Primary);
                Some((raw, result))
            }
            Err(e) => {
                warn!(error = %e, model = vision.model(), "Primary vision model unavailable");
                None
            }
        }
    }

    /// Run preprocessing plus the classical OCR engine
    async fn run_classical(&self, image: &[u8]) -> ExtractionResult {
        if !self.config.fallback.enable_classical_ocr {
            return ExtractionResult::failed("classical OCR disabled");
        }
        let Some(engine) = &self.classical else {
            return ExtractionResult::failed("no classical OCR engine configured");
        };

        match engine.recognize(image).await {
            Ok(text) => {
                debug!(engine = engine.name(), chars = text.len(), "Classical OCR complete");
                self.result_from_output(&text, ExtractionMethod::ClassicalOcr)
            }
            Err(e) => ExtractionResult::failed(format!("classical OCR failed: {}", e)),
        }
    }

    /// Run the handwriting pass when the decision function asks for it
    async fn maybe_recover_tip(&self, image: &[u8], result: ExtractionResult) -> ExtractionResult {
        let action = garble::next_action(
            &Verdict::Trusted,
            result.method,
            &result,
            &self.config.fallback,
        );
        if action == FallbackAction::TryHandwriting {
            self.merge_tip(image, result).await
        } else {
            result
        }
    }

    /// Handwriting pass: read the bottom third of the receipt for a tip
    ///
    /// Merges only a missing tip; an already-found total is never replaced.
    async fn merge_tip(&self, image: &[u8], mut result: ExtractionResult) -> ExtractionResult {
        let Some(vision) = &self.vision else {
            return result;
        };

        // Crop when the payload decodes as an image; otherwise hand the
        // engine the full payload
        let payload = match image::load_from_memory(image) {
            Ok(img) => {
                let crop = ocr::bottom_third(&img);
                let mut png = Vec::new();
                match crop.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png) {
                    Ok(()) => png,
                    Err(_) => image.to_vec(),
                }
            }
            Err(_) => image.to_vec(),
        };

        match vision.generate(&payload, PromptId::ReadTip).await {
            Ok(raw) => {
                let tip = parsing::parse_model_output(&raw)
                    .and_then(|f| f.tip)
                    .filter(|t| *t > 0.0);
                if result.tip.is_none() {
                    if let Some(tip) = tip {
                        debug!(tip, "Handwriting pass recovered tip");
                        result.tip = Some(tip);
                        result.method = ExtractionMethod::Handwriting;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Handwriting pass failed"),
        }

        result
    }

    /// Turn raw engine output into a finalized result
    ///
    /// Structured output (JSON or key/value stream) is preferred; free text
    /// goes through the line-mining heuristics.
    fn result_from_output(&self, raw: &str, method: ExtractionMethod) -> ExtractionResult {
        let table = self.aliases.current();
        let mined = match parsing::parse_model_output(raw) {
            Some(model_fields) => self.mined_from_model(model_fields),
            None => fields::mine_fields(raw, &table, &self.config.extraction),
        };
        self.finalize(mined, method)
    }

    /// Convert structured model fields into the shared mined representation
    fn mined_from_model(&self, model: ModelFields) -> MinedFields {
        let (date, date_explicit_format) = model
            .date
            .as_deref()
            .and_then(normalize_date_detailed)
            .map(|(d, explicit)| (Some(d), explicit))
            .unwrap_or((None, false));

        MinedFields {
            merchant: model.merchant.filter(|m| !m.trim().is_empty()),
            date,
            date_explicit_format,
            total: model.total,
            subtotal: model.subtotal,
            tip: model.tip.filter(|t| *t > 0.0),
        }
    }

    /// Sanitize amounts, flag issues, normalize the merchant, and compute
    /// confidence
    fn finalize(&self, mut mined: MinedFields, method: ExtractionMethod) -> ExtractionResult {
        let config = &self.config.extraction;
        let table = self.aliases.current();

        // Totals are magnitudes after sanitization
        if let Some(total) = mined.total {
            let total = total.abs();
            let corrected = if config.leading_digit_fix {
                fields::strip_spurious_leading_digit(total, config)
            } else {
                None
            };
            mined.total = Some(corrected.unwrap_or(total));
        }
        mined.subtotal = mined.subtotal.map(f64::abs);
        mined.tip = mined.tip.map(f64::abs);

        let mut issues = BTreeSet::new();
        if mined
            .merchant
            .as_deref()
            .map(|m| m.trim().is_empty())
            .unwrap_or(true)
        {
            issues.insert(ExtractionIssue::MerchantMissing);
        }
        if mined.date.is_none() {
            issues.insert(ExtractionIssue::DateMissing);
        }
        match mined.total {
            Some(total) if total == 0.0 => {
                issues.insert(ExtractionIssue::TotalZero);
            }
            Some(total) if total < config.total_min || total > config.total_max => {
                issues.insert(ExtractionIssue::TotalOutOfBounds);
            }
            Some(_) => {}
            None => {
                issues.insert(ExtractionIssue::TotalZero);
            }
        }

        let confidence = fields::confidence_for(&mined, config);
        let merchant_normalized = mined
            .merchant
            .as_deref()
            .map(|m| normalize_merchant_with(&table, m))
            .filter(|m| !m.is_empty());

        ExtractionResult {
            success: true,
            merchant_raw: mined.merchant,
            merchant_normalized,
            date: mined.date,
            total: mined.total,
            subtotal: mined.subtotal,
            tip: mined.tip,
            confidence,
            method,
            issues,
            rejection: None,
            error: None,
        }
    }

    fn cache_key(&self, image: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image);
        format!("{}:{}", hex::encode(hasher.finalize()), self.aliases.version())
    }
}
