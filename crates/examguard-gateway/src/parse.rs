//! Normalisation of vision-model output into an [`AnalysisResult`].
//!
//! Models wrap their JSON in markdown fences, prepend chatter, return
//! numbers as strings, or invent alert types. Everything here is lenient on
//! shape and strict on the result: confidence is clamped to `[0, 1]`,
//! severity to `[1, 5]`, the description is capped, and only known
//! [`IssueKind`]s survive.

use examguard_core::{AnalysisResult, ExamGuardError, IssueKind, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

/// Longest description kept, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// One level of nested braces is enough for the flat schema we ask for.
static JSON_OBJECT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)\{(?:[^{}]|\{[^{}]*\})*\}").ok());

/// Parse raw model output.
///
/// # Errors
///
/// [`ExamGuardError::InvalidAnalysis`] when no JSON object can be recovered.
pub fn parse_analysis(raw: &str) -> Result<AnalysisResult> {
    let candidate = extract_json(raw);
    let value = match serde_json::from_str::<Value>(candidate) {
        Ok(v) => v,
        Err(e) => {
            debug!("Model output is not clean JSON ({e}); trying fallback extraction");
            JSON_OBJECT
                .as_ref()
                .and_then(|re| re.find(candidate))
                .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
                .ok_or_else(|| {
                    ExamGuardError::InvalidAnalysis(format!(
                        "no JSON object in model output: {}",
                        preview(raw)
                    ))
                })?
        }
    };
    normalise(&value)
}

/// Strip markdown fences and surrounding text down to the outermost braces.
fn extract_json(raw: &str) -> &str {
    let mut content = raw.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest.split("```").next().unwrap_or(rest).trim();
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest.split("```").next().unwrap_or(rest).trim();
    }
    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => content,
    }
}

/// Map a parsed JSON value onto the closed result type.
pub fn normalise(value: &Value) -> Result<AnalysisResult> {
    let obj = value.as_object().ok_or_else(|| {
        ExamGuardError::InvalidAnalysis("model output is not a JSON object".to_string())
    })?;

    let suspicious = obj.get("is_suspicious").map_or(false, as_bool);
    let confidence = obj.get("confidence").and_then(as_f64).unwrap_or(0.5);
    let severity = obj
        .get("severity")
        .and_then(as_f64)
        .map_or(1, |s| s.round().clamp(1.0, 5.0) as u8);
    let description: String = match obj.get("description") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "Analysis completed".to_string(),
        Some(other) => other.to_string(),
    }
    .chars()
    .take(MAX_DESCRIPTION_CHARS)
    .collect();

    let mut result = AnalysisResult::new(suspicious, confidence, severity, description);

    let alert_type = obj.get("alert_type").and_then(Value::as_str).map(str::trim);
    if alert_type.is_some_and(|t| t.eq_ignore_ascii_case("none")) {
        // Nothing reportable. The empty issue set makes a suspicious verdict
        // inconclusive downstream.
        if result.suspicious {
            debug!("Model flagged suspicion with alert_type none; no issue recorded");
        }
        return Ok(result);
    }
    if let Some(kind) = alert_type.and_then(|s| s.parse::<IssueKind>().ok()) {
        result = result.with_issue(kind);
    }
    for label in issue_labels(obj.get("detected_issues")) {
        match label.parse::<IssueKind>() {
            Ok(kind) => result = result.with_issue(kind),
            Err(_) => debug!(issue = %label, "Dropping unrecognised issue"),
        }
    }
    if result.suspicious && result.issues.is_empty() {
        result = result.with_issue(IssueKind::SuspiciousActivity);
    }
    Ok(result)
}

fn issue_labels(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json() {
        let r = parse_analysis(
            r#"{"is_suspicious": false, "confidence": 0.95, "detected_issues": [], "severity": 1, "description": "Student focused", "alert_type": "none"}"#,
        )
        .unwrap();
        assert!(!r.suspicious);
        assert!((r.confidence - 0.95).abs() < 1e-9);
        assert!(r.issues.is_empty());
        assert_eq!(r.description, "Student focused");
    }

    #[test]
    fn test_fenced_json_with_chatter() {
        let raw = "```json\n{\"is_suspicious\": true, \"confidence\": 0.9, \"severity\": 4, \"alert_type\": \"phone_detected\", \"description\": \"Phone in hand\"}\n```\nLet me know if you need more.";
        let r = parse_analysis(raw).unwrap();
        assert!(r.suspicious);
        assert_eq!(r.severity, 4);
        assert!(r.issues.contains(&IssueKind::PhoneDetected));
    }

    #[test]
    fn test_leading_text_is_trimmed() {
        let raw = "Sure! Here is the analysis: {\"is_suspicious\": true, \"confidence\": 0.88, \"severity\": 3, \"alert_type\": \"multiple_people\"} Hope it helps";
        let r = parse_analysis(raw).unwrap();
        assert!(r.issues.contains(&IssueKind::MultiplePeople));
    }

    #[test]
    fn test_regex_fallback_picks_first_object() {
        let raw = "{\"is_suspicious\": true, \"confidence\": 0.9, \"severity\": 5} and also {\"note\": 1}";
        let r = parse_analysis(raw).unwrap();
        assert!(r.suspicious);
        assert_eq!(r.severity, 5);
    }

    #[test]
    fn test_garbage_is_invalid() {
        assert!(matches!(
            parse_analysis("the student looks fine"),
            Err(ExamGuardError::InvalidAnalysis(_))
        ));
        assert!(parse_analysis("[1, 2, 3]").is_err());
    }

    #[test]
    fn test_values_are_clamped_and_coerced() {
        let r = parse_analysis(
            r#"{"is_suspicious": "true", "confidence": "1.4", "severity": 9, "alert_type": "reading_from_material"}"#,
        )
        .unwrap();
        assert!(r.suspicious);
        assert_eq!(r.confidence, 1.0);
        assert_eq!(r.severity, 5);

        let r = parse_analysis(r#"{"is_suspicious": false, "confidence": -3, "severity": 0}"#).unwrap();
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.severity, 1);
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let r = parse_analysis("{}").unwrap();
        assert!(!r.suspicious);
        assert_eq!(r.confidence, 0.5);
        assert_eq!(r.severity, 1);
        assert_eq!(r.description, "Analysis completed");
    }

    #[test]
    fn test_description_is_truncated() {
        let long = "x".repeat(2_000);
        let raw = format!(r#"{{"description": "{long}"}}"#);
        let r = parse_analysis(&raw).unwrap();
        assert_eq!(r.description.chars().count(), MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn test_unknown_issues_dropped_and_fallback_kind_applied() {
        let r = parse_analysis(
            r#"{"is_suspicious": true, "confidence": 0.9, "detected_issues": ["weird hat", "Talking to someone"], "alert_type": "teleportation"}"#,
        )
        .unwrap();
        assert_eq!(r.issues.len(), 1);
        assert!(r.issues.contains(&IssueKind::TalkingToSomeone));

        let r = parse_analysis(
            r#"{"is_suspicious": true, "confidence": 0.9, "detected_issues": "weird hat"}"#,
        )
        .unwrap();
        assert_eq!(r.issues.len(), 1);
        assert!(r.issues.contains(&IssueKind::SuspiciousActivity));
    }

    #[test]
    fn test_alert_type_none_records_no_issue() {
        let r = parse_analysis(
            r#"{"is_suspicious": true, "confidence": 0.9, "detected_issues": "weird hat", "alert_type": "none"}"#,
        )
        .unwrap();
        assert!(r.suspicious);
        assert!(r.issues.is_empty());

        let r = parse_analysis(
            r#"{"is_suspicious": true, "confidence": 0.9, "detected_issues": ["phone"], "alert_type": " NONE "}"#,
        )
        .unwrap();
        assert!(r.issues.is_empty());
    }
}
