use crate::error::ValidationError;
use crate::models::ExtractionResult;
use serde_json::Value;

/// Reduces provider content to its outermost `{...}` span, dropping Markdown
/// fences and any prose around the object.
pub fn strip_json_fence(content: &str) -> &str {
    let mut text = content.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|ch: char| ch.is_ascii_alphabetic());
        text = rest.trim_start();
        if let Some(body) = text.trim_end().strip_suffix("```") {
            text = body.trim_end();
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

/// Parses and checks provider output against the canonical extraction shape:
/// `{"entities": [{name, type, count}], "relations": [{source, target, relation, evidence}]}`.
/// Unknown fields are rejected at every level.
pub fn validate_extraction(raw: &str) -> Result<ExtractionResult, ValidationError> {
    let value: Value =
        serde_json::from_str(strip_json_fence(raw)).map_err(|error| ValidationError::Json(error.to_string()))?;

    if !value.is_object() {
        return Err(ValidationError::Schema("top level value must be an object".to_string()));
    }

    let result: ExtractionResult =
        serde_json::from_value(value).map_err(|error| ValidationError::Schema(error.to_string()))?;

    if let Some(entity) = result.entities.iter().find(|entity| entity.count < 1) {
        return Err(ValidationError::Schema(format!(
            "entity {} has count {}, expected at least 1",
            entity.name, entity.count
        )));
    }

    if let Some(relation) = result
        .relations
        .iter()
        .find(|relation| relation.confidence.is_some_and(|value| !(0.0..=1.0).contains(&value)))
    {
        return Err(ValidationError::Schema(format!(
            "relation {} -> {} has confidence outside [0, 1]",
            relation.source, relation.target
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "entities": [{"name": "Rust", "type": "Technology", "count": 3}],
        "relations": [{"source": "Rust", "target": "Cargo", "relation": "uses", "evidence": "Rust uses Cargo."}]
    }"#;

    #[test]
    fn fenced_and_chatty_content_is_unwrapped() {
        assert_eq!(strip_json_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_json_fence("Sure! Here it is: {\"a\": {\"b\": 2}} Hope that helps."), "{\"a\": {\"b\": 2}}");
        assert_eq!(strip_json_fence("no object"), "no object");
    }

    #[test]
    fn valid_output_parses() {
        let result = validate_extraction(VALID).unwrap();
        assert_eq!(result.entities[0].entity_type, "Technology");
        assert_eq!(result.relations[0].confidence, None);
    }

    #[test]
    fn broken_json_and_schema_mismatches_are_distinct() {
        assert!(matches!(validate_extraction("{\"entities\": ["), Err(ValidationError::Json(_))));
        assert!(matches!(validate_extraction("[]"), Err(ValidationError::Schema(_))));
        assert!(matches!(
            validate_extraction(r#"{"entities": []}"#),
            Err(ValidationError::Schema(_))
        ));
        assert!(matches!(
            validate_extraction(r#"{"entities": [], "relations": [], "notes": "extra"}"#),
            Err(ValidationError::Schema(_))
        ));
        assert!(matches!(
            validate_extraction(r#"{"entities": [{"name": "A", "type": "T", "count": 0}], "relations": []}"#),
            Err(ValidationError::Schema(_))
        ));
        assert!(matches!(
            validate_extraction(
                r#"{"entities": [], "relations": [{"source": "A", "target": "B", "relation": "r", "evidence": "e", "confidence": 3.5}]}"#
            ),
            Err(ValidationError::Schema(_))
        ));
    }

    #[test]
    fn entity_properties_are_allowed() {
        let raw = r#"{"entities": [{"name": "A", "type": "T", "count": 1, "properties": {"era": "modern"}}], "relations": []}"#;
        let result = validate_extraction(raw).unwrap();
        assert!(result.entities[0].properties.is_some());
    }
}
