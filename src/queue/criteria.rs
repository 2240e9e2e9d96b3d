//! Compatibility criteria attached to a queue
//!
//! A criterion names a player attribute and how two tickets' values for it
//! are compared. Range criteria additionally carry the tolerance growth used
//! by the scorer.

use crate::error::{MatchmakingError, Result};
use serde::{Deserialize, Serialize};

/// Comparison applied between the anchor's and the candidate's attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionOperator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    Range,
}

impl std::fmt::Display for CriterionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CriterionOperator::Equal => "equal",
            CriterionOperator::LessThan => "less_than",
            CriterionOperator::LessThanOrEqual => "less_than_or_equal",
            CriterionOperator::GreaterThan => "greater_than",
            CriterionOperator::GreaterThanOrEqual => "greater_than_or_equal",
            CriterionOperator::Contains => "contains",
            CriterionOperator::StartsWith => "starts_with",
            CriterionOperator::EndsWith => "ends_with",
            CriterionOperator::Range => "range",
        };
        write!(f, "{}", name)
    }
}

/// A single attribute-based compatibility rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Player attribute key looked up in both tickets' snapshots
    pub key: String,
    pub operator: CriterionOperator,
    /// Base tolerance for range criteria, grown by wait time
    #[serde(default)]
    pub expansion_rate: Option<f64>,
    /// Fixed tolerance for range criteria; overrides the wait-time growth when set
    #[serde(default)]
    pub max_expansion: Option<f64>,
}

impl Criterion {
    pub fn new(key: impl Into<String>, operator: CriterionOperator) -> Self {
        Self {
            key: key.into(),
            operator,
            expansion_rate: None,
            max_expansion: None,
        }
    }

    pub fn equal(key: impl Into<String>) -> Self {
        Self::new(key, CriterionOperator::Equal)
    }

    pub fn range(key: impl Into<String>, expansion_rate: f64) -> Self {
        Self {
            expansion_rate: Some(expansion_rate),
            ..Self::new(key, CriterionOperator::Range)
        }
    }

    pub fn with_max_expansion(mut self, max_expansion: f64) -> Self {
        self.max_expansion = Some(max_expansion);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(MatchmakingError::validation("Criterion key cannot be empty").into());
        }

        if self.operator == CriterionOperator::Range {
            match self.expansion_rate {
                Some(rate) if rate > 0.0 && rate.is_finite() => {}
                _ => {
                    return Err(MatchmakingError::validation(format!(
                        "Range criterion '{}' requires a positive expansion rate",
                        self.key
                    ))
                    .into())
                }
            }
            if let Some(cap) = self.max_expansion {
                if cap < 0.0 || !cap.is_finite() {
                    return Err(MatchmakingError::validation(format!(
                        "Range criterion '{}' has an invalid max expansion",
                        self.key
                    ))
                    .into());
                }
            }
        } else if self.expansion_rate.is_some() || self.max_expansion.is_some() {
            return Err(MatchmakingError::validation(format!(
                "Criterion '{}' uses expansion settings but is not a range criterion",
                self.key
            ))
            .into());
        }

        Ok(())
    }
}

/// Validate a whole criteria list
pub fn validate_criteria(criteria: &[Criterion]) -> Result<()> {
    for criterion in criteria {
        criterion.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_requires_expansion_rate() {
        let criterion = Criterion::new("skill", CriterionOperator::Range);
        assert!(criterion.validate().is_err());

        assert!(Criterion::range("skill", 10.0).validate().is_ok());
        assert!(Criterion::range("skill", 0.0).validate().is_err());
        assert!(Criterion::range("skill", 10.0)
            .with_max_expansion(-1.0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_expansion_only_on_range() {
        let mut criterion = Criterion::equal("region");
        assert!(criterion.validate().is_ok());

        criterion.expansion_rate = Some(5.0);
        assert!(criterion.validate().is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(Criterion::equal("  ").validate().is_err());
    }

    #[test]
    fn test_operator_deserializes_snake_case() {
        let criterion: Criterion =
            serde_json::from_str(r#"{"key":"mode","operator":"starts_with"}"#).unwrap();
        assert_eq!(criterion.operator, CriterionOperator::StartsWith);
        assert!(criterion.expansion_rate.is_none());
    }
}
