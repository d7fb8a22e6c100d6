//! Post-extraction validation
//!
//! Sanity checks that run after extraction and matching: bounds on totals,
//! required-field presence, and cross-field consistency. Validation never
//! invents data; it downgrades confidence or rejects a result outright so
//! callers can route low-quality extractions to human review.

use tracing::debug;

use crate::config::ExtractionConfig;
use crate::models::{ExtractionIssue, ExtractionResult};

/// Confidence multiplier for an out-of-bounds total
const OUT_OF_BOUNDS_PENALTY: f64 = 0.5;

/// Confidence multiplier for cross-field inconsistency
const INCONSISTENCY_PENALTY: f64 = 0.7;

/// Post-extraction validator
#[derive(Debug, Clone)]
pub struct Validator {
    config: ExtractionConfig,
}

impl Validator {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Apply all checks to an extraction result
    ///
    /// Failed results pass through untouched. A result with no usable field
    /// at all is rejected; anything else keeps `success = true` with a
    /// possibly-downgraded confidence and extra `issues` flags.
    pub fn validate(&self, mut result: ExtractionResult) -> ExtractionResult {
        if !result.success {
            return result;
        }

        // Bounds on the total
        if let Some(total) = result.total {
            if total < self.config.total_min || total > self.config.total_max {
                result.issues.insert(ExtractionIssue::TotalOutOfBounds);
                result.confidence *= OUT_OF_BOUNDS_PENALTY;
            }
        }

        // Cross-field consistency
        if self.fields_inconsistent(&result) {
            result.issues.insert(ExtractionIssue::FieldsInconsistent);
            result.confidence *= INCONSISTENCY_PENALTY;
        }

        // Required-field presence: nothing usable means rejection
        let merchant_missing = result
            .merchant_normalized
            .as_deref()
            .map(|m| m.is_empty())
            .unwrap_or(true);
        let total_usable = result
            .total
            .map(|t| t >= self.config.total_min && t <= self.config.total_max)
            .unwrap_or(false);
        if merchant_missing && !total_usable && result.date.is_none() {
            debug!("Extraction rejected: no usable fields");
            result.success = false;
            result.confidence = 0.0;
            result.error = Some("no usable fields extracted".to_string());
            return result;
        }

        result.confidence = result.confidence.clamp(0.0, 1.0);

        // Optional confidence floor; disabled at the default of 0.0
        if result.confidence < self.config.confidence_floor {
            debug!(
                confidence = result.confidence,
                floor = self.config.confidence_floor,
                "Extraction rejected below confidence floor"
            );
            result.success = false;
            result.error = Some("confidence below configured floor".to_string());
        }

        result
    }

    /// Subtotal or tip exceeding the total cannot be right
    fn fields_inconsistent(&self, result: &ExtractionResult) -> bool {
        let Some(total) = result.total else {
            return false;
        };
        if let Some(subtotal) = result.subtotal {
            if subtotal > total + 0.01 {
                return true;
            }
        }
        if let Some(tip) = result.tip {
            if tip > total + 0.01 {
                return true;
            }
        }
        false
    }
}
