//! Value derivation for property merge/split and duplicate survival.

use crate::error::Error;
use crate::schema::{compiled_regex, PropertyDef};
use crate::store::ObjectId;
use flexibase_proto::Value;

/// How the survivor of a duplicate group is chosen.
///
/// Comparison is a pluggable named strategy rather than an expression
/// language; every strategy is deterministic for a given group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurvivorPolicy {
    /// Prefer the object with the most incoming references, ties broken
    /// by the most recently updated, then lowest id.
    #[default]
    MostReferencedThenNewest,
    /// Prefer the most recently created object.
    Newest,
    /// Prefer the oldest object.
    Oldest,
    /// Prefer the lowest object id.
    LowestId,
}

/// One member of a duplicate group, with the facts survival depends on.
#[derive(Debug, Clone, Copy)]
pub struct SurvivorCandidate {
    /// The candidate object.
    pub object: ObjectId,
    /// Incoming reference count.
    pub incoming_references: usize,
    /// Creation timestamp, microseconds since Unix epoch.
    pub created_at: u64,
    /// Last-write timestamp, microseconds since Unix epoch.
    pub updated_at: u64,
}

impl SurvivorPolicy {
    /// Pick the surviving candidate from a non-empty group.
    pub fn pick(&self, candidates: &[SurvivorCandidate]) -> Option<ObjectId> {
        let best = match self {
            SurvivorPolicy::MostReferencedThenNewest => candidates.iter().max_by(|a, b| {
                a.incoming_references
                    .cmp(&b.incoming_references)
                    .then(a.updated_at.cmp(&b.updated_at))
                    .then(b.object.cmp(&a.object))
            }),
            SurvivorPolicy::Newest => candidates
                .iter()
                .max_by(|a, b| a.created_at.cmp(&b.created_at).then(b.object.cmp(&a.object))),
            SurvivorPolicy::Oldest => candidates
                .iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.object.cmp(&b.object))),
            SurvivorPolicy::LowestId => candidates.iter().min_by_key(|c| c.object),
        };
        best.map(|c| c.object)
    }
}

/// A rule deriving one new property from a source property's value.
///
/// The pattern is a regular expression; on a match the first capture
/// group (or the whole match when there are no groups) becomes the new
/// property's value. A non-matching rule falls back to the new
/// property's default value.
#[derive(Debug, Clone)]
pub struct SplitRule {
    /// Definition of the property to create.
    pub new_property: PropertyDef,
    /// Extraction pattern applied to the source value's text form.
    pub pattern: String,
}

impl SplitRule {
    /// Create a split rule.
    pub fn new(new_property: PropertyDef, pattern: impl Into<String>) -> Self {
        Self {
            new_property,
            pattern: pattern.into(),
        }
    }

    /// Apply the rule to a source value. Returns None when the pattern
    /// does not match.
    pub fn apply(&self, source: &Value) -> Result<Option<Value>, Error> {
        let re = compiled_regex(&self.pattern)
            .map_err(|e| Error::SchemaConflict(format!("invalid split pattern: {}", e)))?;
        let text = source.to_display_string();
        let Some(captures) = re.captures(&text) else {
            return Ok(None);
        };
        let extracted = captures
            .get(1)
            .or_else(|| captures.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Ok(Some(Value::Text(extracted)))
    }
}

/// Evaluate a concatenation expression against a named row.
///
/// The expression is a `||`-joined list of segments; a segment is
/// either a single-quoted literal or a property name. Missing or null
/// properties contribute the empty string.
pub fn eval_concat(expression: &str, row: &[(String, Value)]) -> Result<Value, Error> {
    if expression.trim().is_empty() {
        return Err(Error::SchemaConflict("empty merge expression".into()));
    }

    let mut out = String::new();
    for segment in expression.split("||") {
        let segment = segment.trim();
        if segment.len() >= 2 && segment.starts_with('\'') && segment.ends_with('\'') {
            out.push_str(&segment[1..segment.len() - 1]);
        } else if segment.is_empty() {
            return Err(Error::SchemaConflict(format!(
                "malformed merge expression '{}'",
                expression
            )));
        } else {
            let value = row
                .iter()
                .find(|(name, _)| name == segment)
                .map(|(_, v)| v.to_display_string())
                .unwrap_or_default();
            out.push_str(&value);
        }
    }
    Ok(Value::Text(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;

    fn candidate(id: u64, refs: usize, created: u64) -> SurvivorCandidate {
        SurvivorCandidate {
            object: ObjectId(id),
            incoming_references: refs,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn test_survivor_most_referenced() {
        let group = vec![candidate(1, 0, 300), candidate(2, 5, 100), candidate(3, 2, 200)];
        assert_eq!(
            SurvivorPolicy::MostReferencedThenNewest.pick(&group),
            Some(ObjectId(2))
        );
    }

    #[test]
    fn test_survivor_reference_tie_falls_to_most_recently_updated() {
        let group = vec![candidate(1, 3, 100), candidate(2, 3, 200)];
        assert_eq!(
            SurvivorPolicy::MostReferencedThenNewest.pick(&group),
            Some(ObjectId(2))
        );

        // An older object updated after the newer one wins the tie.
        let mut touched = candidate(1, 3, 100);
        touched.updated_at = 500;
        let group = vec![touched, candidate(2, 3, 200)];
        assert_eq!(
            SurvivorPolicy::MostReferencedThenNewest.pick(&group),
            Some(ObjectId(1))
        );
    }

    #[test]
    fn test_survivor_other_policies() {
        let group = vec![candidate(5, 0, 100), candidate(3, 9, 300), candidate(8, 1, 200)];
        assert_eq!(SurvivorPolicy::Newest.pick(&group), Some(ObjectId(3)));
        assert_eq!(SurvivorPolicy::Oldest.pick(&group), Some(ObjectId(5)));
        assert_eq!(SurvivorPolicy::LowestId.pick(&group), Some(ObjectId(3)));
    }

    #[test]
    fn test_survivor_empty_group() {
        assert_eq!(SurvivorPolicy::default().pick(&[]), None);
    }

    #[test]
    fn test_concat_expression() {
        let row = vec![
            ("FirstName".to_string(), Value::Text("Ada".into())),
            ("LastName".to_string(), Value::Text("Lovelace".into())),
        ];
        let result = eval_concat("FirstName || ' ' || LastName", &row).unwrap();
        assert_eq!(result, Value::Text("Ada Lovelace".into()));
    }

    #[test]
    fn test_concat_missing_property_is_empty() {
        let row = vec![("A".to_string(), Value::Text("x".into()))];
        let result = eval_concat("A || '-' || B", &row).unwrap();
        assert_eq!(result, Value::Text("x-".into()));
    }

    #[test]
    fn test_concat_non_text_values() {
        let row = vec![("Age".to_string(), Value::Int(30))];
        let result = eval_concat("'age: ' || Age", &row).unwrap();
        assert_eq!(result, Value::Text("age: 30".into()));
    }

    #[test]
    fn test_concat_rejects_empty() {
        assert!(eval_concat("", &[]).is_err());
        assert!(eval_concat("A || || B", &[]).is_err());
    }

    #[test]
    fn test_split_rule_capture_group() {
        let rule = SplitRule::new(
            PropertyDef::text("AreaCode", 5),
            r"^\((\d+)\)",
        );
        let result = rule.apply(&Value::Text("(020) 1234567".into())).unwrap();
        assert_eq!(result, Some(Value::Text("020".into())));
    }

    #[test]
    fn test_split_rule_whole_match() {
        let rule = SplitRule::new(PropertyDef::text("Digits", 20), r"\d+");
        let result = rule.apply(&Value::Text("abc123def".into())).unwrap();
        assert_eq!(result, Some(Value::Text("123".into())));
    }

    #[test]
    fn test_split_rule_no_match() {
        let rule = SplitRule::new(
            PropertyDef::new("N", DataType::Text),
            r"^\d+$",
        );
        assert_eq!(rule.apply(&Value::Text("letters".into())).unwrap(), None);
    }

    #[test]
    fn test_split_rule_bad_pattern() {
        let rule = SplitRule::new(PropertyDef::text("X", 5), "(unclosed");
        assert!(rule.apply(&Value::Text("x".into())).is_err());
    }
}
