//! Garbled-output detection and fallback decisions
//!
//! A primary extraction is either `Trusted` or `Rejected`, evaluated once per
//! extraction. The decision functions here are pure: they look only at the
//! raw model output and the structured result, never at the engines, so the
//! whole fallback policy is testable without a model in the loop.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ExtractionConfig, FallbackConfig};
use crate::models::{ExtractionIssue, ExtractionMethod, ExtractionResult, RejectReason};
use crate::normalize::normalize_date;

/// Clock-like strings ("7:42", "07:42 PM") that sometimes land in the
/// merchant slot when the model derails
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}:\d{2}(?::\d{2})?\s*(?i:am|pm)?$").expect("time regex"));

/// Outcome of the garbled-output check
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Trusted,
    Rejected(RejectReason),
}

/// What the fallback chain should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    /// Keep the result as-is
    Accept,
    /// Re-run extraction with the classical OCR pipeline
    TryClassicalOcr,
    /// Run the handwriting pass on the bottom third to recover a tip
    TryHandwriting,
    /// No engine left to try
    GiveUp,
}

/// Evaluate a primary extraction against the rejection triggers
pub fn assess(raw_output: &str, result: &ExtractionResult, config: &FallbackConfig) -> Verdict {
    if let Some(ratio) = unique_token_ratio(raw_output, config.min_repetition_window) {
        if ratio < config.min_unique_token_ratio {
            return Verdict::Rejected(RejectReason::RepetitiveOutput { unique_ratio: ratio });
        }
    }

    if let Some(merchant) = result.merchant_raw.as_deref() {
        if merchant_looks_like_date(merchant) {
            return Verdict::Rejected(RejectReason::MerchantLooksLikeDate);
        }
    }

    if let Some(total) = result.total {
        if total > config.hard_total_ceiling {
            return Verdict::Rejected(RejectReason::TotalAboveCeiling { total });
        }
    }

    let structural: Vec<ExtractionIssue> = result
        .issues
        .iter()
        .copied()
        .filter(|i| {
            matches!(
                i,
                ExtractionIssue::TotalOutOfBounds | ExtractionIssue::MerchantMissing
            )
        })
        .collect();
    if !structural.is_empty() {
        return Verdict::Rejected(RejectReason::Issues(structural));
    }

    Verdict::Trusted
}

/// Ratio of unique tokens among the trailing tokens of the raw output
///
/// Returns `None` when the output is too short for the check to apply.
/// A low ratio is the signature of a looping decoder.
pub fn unique_token_ratio(text: &str, window: usize) -> Option<f64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() < window {
        return None;
    }
    // The loop shows up at the end of the stream; look at the last 30 tokens
    let tail = &tokens[tokens.len().saturating_sub(30)..];
    let unique: std::collections::HashSet<&&str> = tail.iter().collect();
    Some(unique.len() as f64 / tail.len() as f64)
}

/// The extracted merchant parsing as a date or time is a strong garble signal
fn merchant_looks_like_date(merchant: &str) -> bool {
    let trimmed = merchant.trim();
    normalize_date(trimmed).is_some() || TIME_RE.is_match(trimmed)
}

/// Decide the next step of the fallback chain
///
/// Pure over (verdict, producing method, result, config); the extractor just
/// executes whatever this returns.
pub fn next_action(
    verdict: &Verdict,
    method: ExtractionMethod,
    result: &ExtractionResult,
    config: &FallbackConfig,
) -> FallbackAction {
    match verdict {
        Verdict::Trusted => {
            // The handwriting pass exists only to recover a missing tip and
            // never overwrites a found total
            if config.enable_handwriting_pass
                && method != ExtractionMethod::Handwriting
                && result.total.is_some()
                && result.tip.is_none()
            {
                FallbackAction::TryHandwriting
            } else {
                FallbackAction::Accept
            }
        }
        Verdict::Rejected(_) => match method {
            ExtractionMethod::Primary if config.enable_classical_ocr => {
                FallbackAction::TryClassicalOcr
            }
            _ => FallbackAction::GiveUp,
        },
    }
}

/// Choose between a rejected primary result and its classical fallback
///
/// The fallback wins when its confidence is materially higher, or when it is
/// coherent while the primary is not; a rejected primary's confidence score
/// is not trusted on its own. The winning fallback carries the rejection
/// provenance.
pub fn select_result(
    primary: ExtractionResult,
    fallback: ExtractionResult,
    reason: RejectReason,
    extraction: &ExtractionConfig,
    config: &FallbackConfig,
) -> ExtractionResult {
    if !fallback.success {
        return primary;
    }

    let materially_higher = fallback.confidence > primary.confidence + config.confidence_margin;
    let coherent_over_incoherent = fallback
        .is_coherent(extraction.total_min, extraction.total_max)
        && !primary.is_coherent(extraction.total_min, extraction.total_max);

    if materially_higher || coherent_over_incoherent {
        tracing::debug!(
            primary_confidence = primary.confidence,
            fallback_confidence = fallback.confidence,
            reason = %reason,
            "Fallback result selected over rejected primary"
        );
        ExtractionResult {
            rejection: Some(reason),
            ..fallback
        }
    } else {
        primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn fallback_config() -> FallbackConfig {
        FallbackConfig::default()
    }

    fn extraction_config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    fn trusted_result() -> ExtractionResult {
        ExtractionResult {
            success: true,
            merchant_raw: Some("WENDY'S".into()),
            total: Some(8.42),
            confidence: 0.7,
            ..Default::default()
        }
    }

    #[test]
    fn test_repetitive_stream_always_rejected() {
        let raw = "total total total total total total total total total total total total";
        let verdict = assess(raw, &trusted_result(), &fallback_config());
        assert!(matches!(
            verdict,
            Verdict::Rejected(RejectReason::RepetitiveOutput { .. })
        ));
    }

    #[test]
    fn test_varied_stream_trusted() {
        let raw = "WENDY'S 123 MAIN ST ORDER 81 DATE 03/02/2024 BURGER 5.99 FRIES 2.43 TOTAL 8.42";
        let verdict = assess(raw, &trusted_result(), &fallback_config());
        assert_eq!(verdict, Verdict::Trusted);
    }

    #[test]
    fn test_short_output_skips_repetition_check() {
        assert_eq!(unique_token_ratio("a a a", 10), None);
    }

    #[test]
    fn test_merchant_as_date_rejected() {
        let mut result = trusted_result();
        result.merchant_raw = Some("06/10/2024".into());
        let verdict = assess("plausible output text here with enough tokens one two three four five", &result, &fallback_config());
        assert_eq!(verdict, Verdict::Rejected(RejectReason::MerchantLooksLikeDate));
    }

    #[test]
    fn test_merchant_as_time_rejected() {
        let mut result = trusted_result();
        result.merchant_raw = Some("7:42 PM".into());
        let verdict = assess("short", &result, &fallback_config());
        assert_eq!(verdict, Verdict::Rejected(RejectReason::MerchantLooksLikeDate));
    }

    #[test]
    fn test_total_above_ceiling_rejected() {
        let mut result = trusted_result();
        result.total = Some(8125.00);
        let verdict = assess("short", &result, &fallback_config());
        assert!(matches!(
            verdict,
            Verdict::Rejected(RejectReason::TotalAboveCeiling { .. })
        ));
    }

    #[test]
    fn test_structural_issues_rejected() {
        let mut result = trusted_result();
        result.merchant_raw = None;
        let mut issues = BTreeSet::new();
        issues.insert(ExtractionIssue::MerchantMissing);
        result.issues = issues;
        let verdict = assess("short", &result, &fallback_config());
        assert!(matches!(verdict, Verdict::Rejected(RejectReason::Issues(_))));
    }

    #[test]
    fn test_next_action_rejected_primary_tries_classical() {
        let action = next_action(
            &Verdict::Rejected(RejectReason::MerchantLooksLikeDate),
            ExtractionMethod::Primary,
            &trusted_result(),
            &fallback_config(),
        );
        assert_eq!(action, FallbackAction::TryClassicalOcr);
    }

    #[test]
    fn test_next_action_classical_disabled_gives_up() {
        let config = FallbackConfig {
            enable_classical_ocr: false,
            ..FallbackConfig::default()
        };
        let action = next_action(
            &Verdict::Rejected(RejectReason::MerchantLooksLikeDate),
            ExtractionMethod::Primary,
            &trusted_result(),
            &config,
        );
        assert_eq!(action, FallbackAction::GiveUp);
    }

    #[test]
    fn test_next_action_trusted_accepts() {
        let action = next_action(
            &Verdict::Trusted,
            ExtractionMethod::Primary,
            &trusted_result(),
            &fallback_config(),
        );
        assert_eq!(action, FallbackAction::Accept);
    }

    #[test]
    fn test_next_action_missing_tip_triggers_handwriting() {
        let config = FallbackConfig {
            enable_handwriting_pass: true,
            ..FallbackConfig::default()
        };
        let action = next_action(
            &Verdict::Trusted,
            ExtractionMethod::Primary,
            &trusted_result(),
            &config,
        );
        assert_eq!(action, FallbackAction::TryHandwriting);

        // A found tip means nothing is missing
        let mut with_tip = trusted_result();
        with_tip.tip = Some(1.50);
        let action = next_action(&Verdict::Trusted, ExtractionMethod::Primary, &with_tip, &config);
        assert_eq!(action, FallbackAction::Accept);
    }

    #[test]
    fn test_selection_prefers_materially_higher_confidence() {
        let mut primary = trusted_result();
        primary.confidence = 0.4;
        let mut fallback = trusted_result();
        fallback.confidence = 0.8;
        fallback.method = ExtractionMethod::ClassicalOcr;

        let selected = select_result(
            primary,
            fallback,
            RejectReason::MerchantLooksLikeDate,
            &extraction_config(),
            &fallback_config(),
        );
        assert_eq!(selected.method, ExtractionMethod::ClassicalOcr);
        assert_eq!(selected.rejection, Some(RejectReason::MerchantLooksLikeDate));
        assert_eq!(selected.confidence, 0.8);
    }

    #[test]
    fn test_selection_prefers_coherent_fallback_at_moderate_confidence() {
        // Garbled primary claims high confidence but extracted nothing usable
        let primary = ExtractionResult {
            success: true,
            confidence: 0.9,
            ..Default::default()
        };
        let mut fallback = trusted_result();
        fallback.confidence = 0.55;
        fallback.method = ExtractionMethod::ClassicalOcr;

        let selected = select_result(
            primary,
            fallback,
            RejectReason::RepetitiveOutput { unique_ratio: 0.1 },
            &extraction_config(),
            &fallback_config(),
        );
        assert_eq!(selected.method, ExtractionMethod::ClassicalOcr);
        assert_eq!(selected.confidence, 0.55);
    }

    #[test]
    fn test_selection_keeps_primary_when_fallback_failed() {
        let primary = trusted_result();
        let fallback = ExtractionResult::failed("no OCR engine");
        let selected = select_result(
            primary.clone(),
            fallback,
            RejectReason::MerchantLooksLikeDate,
            &extraction_config(),
            &fallback_config(),
        );
        assert_eq!(selected.method, primary.method);
        assert!(selected.success);
    }
}
