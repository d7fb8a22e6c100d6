//! Parsing helpers for vision-model responses
//!
//! The primary model answers either with a compact JSON object (possibly
//! wrapped in extra prose) or with a key/value token stream. Both shapes are
//! mined here into [`ModelFields`]; free text that matches neither is handed
//! to the line-based field heuristics instead.

use crate::normalize::parse_amount;

/// Structured fields pulled straight out of model output
///
/// All fields optional; absence means the downstream heuristics take over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFields {
    pub merchant: Option<String>,
    pub date: Option<String>,
    pub subtotal: Option<f64>,
    pub tip: Option<f64>,
    pub total: Option<f64>,
}

impl ModelFields {
    /// Anything usable at all?
    pub fn is_empty(&self) -> bool {
        self.merchant.is_none()
            && self.date.is_none()
            && self.subtotal.is_none()
            && self.tip.is_none()
            && self.total.is_none()
    }
}

/// Parse structured fields out of a model response
///
/// Tries the JSON object form first, then the `key: value` token stream.
/// The stream form only counts as structured when most of the response is
/// key/value pairs (at least two known fields, at least half the segments);
/// free receipt text with a stray "Date:" line goes to the line heuristics
/// instead. Returns `None` for anything unstructured.
pub fn parse_model_output(response: &str) -> Option<ModelFields> {
    if let Some(fields) = parse_json_fields(response) {
        if !fields.is_empty() {
            return Some(fields);
        }
    }
    let (fields, matched, segments) = kv_scan(response);
    if !fields.is_empty() && matched >= 2 && matched * 2 >= segments {
        Some(fields)
    } else {
        None
    }
}

/// Find the first balanced JSON object in a noisy response
///
/// Models routinely wrap their JSON in prose; match braces instead of
/// trusting the response to be clean.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in response[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&response[start..=start + i]);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_json_fields(response: &str) -> Option<ModelFields> {
    let json_str = extract_json_object(response)?;
    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let obj = value.as_object()?;

    Some(ModelFields {
        merchant: string_field(obj, &["merchant", "vendor", "store"]),
        date: string_field(obj, &["date", "transaction_date"]),
        subtotal: amount_field(obj, &["subtotal", "sub_total"]),
        tip: amount_field(obj, &["tip", "gratuity"]),
        total: amount_field(obj, &["total", "amount", "grand_total"]),
    })
}

fn string_field(
    obj: &serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<String> {
    for key in keys {
        if let Some(s) = obj.get(*key).and_then(|v| v.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Amounts arrive as numbers or as strings like "$12.34"
fn amount_field(obj: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match obj.get(*key) {
            Some(serde_json::Value::Number(n)) => return n.as_f64(),
            Some(serde_json::Value::String(s)) => {
                let parsed = parse_amount(s);
                if parsed != 0.0 || s.trim() == "0" || s.trim() == "0.00" {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a `key: value` token stream
///
/// Accepts pairs separated by newlines or semicolons, with `:` or `=` between
/// key and value. Unknown keys are ignored.
pub fn parse_kv_stream(response: &str) -> ModelFields {
    kv_scan(response).0
}

/// Scan for key/value pairs, counting how much of the response they cover
fn kv_scan(response: &str) -> (ModelFields, usize, usize) {
    let mut fields = ModelFields::default();
    let mut matched = 0usize;
    let mut segments = 0usize;

    for segment in response.split(['\n', ';']) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        segments += 1;
        let Some((key, value)) = segment.split_once([':', '=']) else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "merchant" | "vendor" | "store" => {
                matched += 1;
                if fields.merchant.is_none() {
                    fields.merchant = Some(value.to_string());
                }
            }
            "date" | "transaction date" => {
                matched += 1;
                if fields.date.is_none() {
                    fields.date = Some(value.to_string());
                }
            }
            "subtotal" | "sub total" => {
                matched += 1;
                if fields.subtotal.is_none() {
                    fields.subtotal = Some(parse_amount(value));
                }
            }
            "tip" | "gratuity" => {
                matched += 1;
                if fields.tip.is_none() {
                    fields.tip = Some(parse_amount(value));
                }
            }
            "total" | "amount due" | "grand total" => {
                matched += 1;
                if fields.total.is_none() {
                    fields.total = Some(parse_amount(value));
                }
            }
            _ => {}
        }
    }

    (fields, matched, segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clean_json() {
        let response = r#"{"merchant": "Wendy's", "date": "2024-03-02", "total": 8.42}"#;
        let fields = parse_model_output(response).unwrap();
        assert_eq!(fields.merchant.as_deref(), Some("Wendy's"));
        assert_eq!(fields.date.as_deref(), Some("2024-03-02"));
        assert_eq!(fields.total, Some(8.42));
        assert_eq!(fields.tip, None);
    }

    #[test]
    fn test_parse_json_with_surrounding_prose() {
        let response = r#"Here is the receipt data you asked for:
{"merchant": "Target", "total": "27.00"}
Let me know if you need anything else!"#;
        let fields = parse_model_output(response).unwrap();
        assert_eq!(fields.merchant.as_deref(), Some("Target"));
        assert_eq!(fields.total, Some(27.00));
    }

    #[test]
    fn test_parse_json_string_amounts() {
        let response = r#"{"merchant": "Cafe", "total": "$1,234.56", "tip": "5.00"}"#;
        let fields = parse_model_output(response).unwrap();
        assert_eq!(fields.total, Some(1234.56));
        assert_eq!(fields.tip, Some(5.00));
    }

    #[test]
    fn test_extract_json_ignores_braces_in_strings() {
        let response = r#"{"merchant": "a } b", "total": 1.0}"#;
        assert_eq!(extract_json_object(response), Some(response));
    }

    #[test]
    fn test_parse_kv_stream() {
        let response = "merchant: WENDY'S\ndate: 03/02/2024\ntotal: $8.42";
        let fields = parse_model_output(response).unwrap();
        assert_eq!(fields.merchant.as_deref(), Some("WENDY'S"));
        assert_eq!(fields.total, Some(8.42));
    }

    #[test]
    fn test_parse_kv_stream_semicolons() {
        let fields = parse_kv_stream("merchant=Uber; total=28.75; tip=0");
        assert_eq!(fields.merchant.as_deref(), Some("Uber"));
        assert_eq!(fields.total, Some(28.75));
    }

    #[test]
    fn test_unstructured_text_yields_none() {
        assert_eq!(parse_model_output("THANK YOU COME AGAIN"), None);
    }

    #[test]
    fn test_labeled_lines_in_free_text_not_structured() {
        // Real OCR text with a stray "Date:" line must go to the line
        // heuristics, not be misread as a structured stream
        let response = "SOHO HOUSE NASHVILLE\n1011 17TH AVE S\nDate: 06/10/2024\nBurger 18.00\nTOTAL $125.00";
        assert_eq!(parse_model_output(response), None);
    }
}
