//! Compatibility scoring between two tickets
//!
//! Pure and deterministic: the same inputs always produce the same score.
//! Every criterion is worth [`CRITERION_WEIGHT`]; the final score is the
//! achieved total over the maximum, so it always lands in `[0, 1]`.

use crate::queue::{Criterion, CriterionOperator};
use crate::types::AttributeSnapshot;
use crate::utils::minutes_between;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

pub const CRITERION_WEIGHT: f64 = 100.0;

/// Wait-time growth per minute applied to range tolerances
const WAIT_GROWTH_PER_MINUTE: f64 = 0.1;

/// Upper bound on the wait-time multiplier
const MAX_WAIT_FACTOR: f64 = 2.0;

/// Multiplier applied to a range criterion's expansion rate after waiting
pub fn wait_factor(minutes_waited: f64) -> f64 {
    (1.0 + WAIT_GROWTH_PER_MINUTE * minutes_waited.max(0.0)).min(MAX_WAIT_FACTOR)
}

/// Tolerance a range criterion allows after `minutes_waited`
///
/// A configured `max_expansion` is used as-is; otherwise the expansion rate
/// grows with the wait factor.
pub fn allowed_tolerance(criterion: &Criterion, minutes_waited: f64) -> f64 {
    match criterion.max_expansion {
        Some(cap) => cap,
        None => criterion.expansion_rate.unwrap_or(0.0) * wait_factor(minutes_waited),
    }
}

/// Normalised compatibility of `candidate` with `anchor` under `criteria`
pub fn score(
    anchor: &AttributeSnapshot,
    candidate: &AttributeSnapshot,
    criteria: &[Criterion],
    anchor_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if criteria.is_empty() {
        return 1.0;
    }

    let minutes_waited = minutes_between(anchor_created_at, now);
    let total: f64 = criteria
        .iter()
        .map(|criterion| {
            match (anchor.get(&criterion.key), candidate.get(&criterion.key)) {
                (Some(a), Some(c)) => criterion_contribution(criterion, a, c, minutes_waited),
                _ => 0.0,
            }
        })
        .sum();

    (total / (CRITERION_WEIGHT * criteria.len() as f64)).clamp(0.0, 1.0)
}

fn criterion_contribution(criterion: &Criterion, anchor: &Value, candidate: &Value, minutes: f64) -> f64 {
    if criterion.operator == CriterionOperator::Range {
        return range_contribution(criterion, anchor, candidate, minutes);
    }

    if compare(criterion.operator, anchor, candidate) {
        CRITERION_WEIGHT
    } else {
        0.0
    }
}

fn range_contribution(criterion: &Criterion, anchor: &Value, candidate: &Value, minutes: f64) -> f64 {
    let (a, c) = match (as_number(anchor), as_number(candidate)) {
        (Some(a), Some(c)) => (a, c),
        // non-numeric range values fall back to exact equality
        _ => {
            return if as_text(anchor) == as_text(candidate) {
                CRITERION_WEIGHT
            } else {
                0.0
            }
        }
    };

    let diff = (a - c).abs();
    let allowed = allowed_tolerance(criterion, minutes);

    if allowed <= 0.0 {
        return if diff == 0.0 { CRITERION_WEIGHT } else { 0.0 };
    }

    if diff <= allowed {
        CRITERION_WEIGHT * (1.0 - diff / allowed)
    } else {
        0.0
    }
}

/// Evaluate `anchor <op> candidate`
///
/// Numeric when both sides parse as numbers, otherwise on the string forms.
fn compare(operator: CriterionOperator, anchor: &Value, candidate: &Value) -> bool {
    let ordering = match (as_number(anchor), as_number(candidate)) {
        (Some(a), Some(c)) => a.partial_cmp(&c),
        _ => Some(as_text(anchor).cmp(&as_text(candidate))),
    };

    match operator {
        CriterionOperator::Equal => ordering == Some(Ordering::Equal),
        CriterionOperator::LessThan => ordering == Some(Ordering::Less),
        CriterionOperator::LessThanOrEqual => {
            matches!(ordering, Some(Ordering::Less | Ordering::Equal))
        }
        CriterionOperator::GreaterThan => ordering == Some(Ordering::Greater),
        CriterionOperator::GreaterThanOrEqual => {
            matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
        }
        CriterionOperator::Contains => as_text(anchor).contains(as_text(candidate).as_str()),
        CriterionOperator::StartsWith => as_text(anchor).starts_with(as_text(candidate).as_str()),
        CriterionOperator::EndsWith => as_text(anchor).ends_with(as_text(candidate).as_str()),
        CriterionOperator::Range => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> AttributeSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_no_criteria_is_fully_compatible() {
        let now = Utc::now();
        assert_eq!(
            score(&attrs(&[]), &attrs(&[]), &[], now, now),
            1.0
        );
    }

    #[test]
    fn test_missing_attribute_contributes_zero() {
        let now = Utc::now();
        let criteria = vec![Criterion::equal("region"), Criterion::equal("mode")];
        let a = attrs(&[("region", json!("eu")), ("mode", json!("ranked"))]);
        let b = attrs(&[("region", json!("eu"))]);
        assert_eq!(score(&a, &b, &criteria, now, now), 0.5);
    }

    #[test]
    fn test_equality_numeric_and_string() {
        let now = Utc::now();
        let criteria = vec![Criterion::equal("level")];
        // "10" and 10.0 both parse as the same number
        let a = attrs(&[("level", json!("10"))]);
        let b = attrs(&[("level", json!(10.0))]);
        assert_eq!(score(&a, &b, &criteria, now, now), 1.0);

        let a = attrs(&[("level", json!("gold"))]);
        let b = attrs(&[("level", json!("silver"))]);
        assert_eq!(score(&a, &b, &criteria, now, now), 0.0);
    }

    #[test]
    fn test_ordering_operators() {
        let now = Utc::now();
        let a = attrs(&[("level", json!(5))]);
        let b = attrs(&[("level", json!(9))]);

        let lt = vec![Criterion::new("level", CriterionOperator::LessThan)];
        assert_eq!(score(&a, &b, &lt, now, now), 1.0);
        assert_eq!(score(&b, &a, &lt, now, now), 0.0);

        let gte = vec![Criterion::new("level", CriterionOperator::GreaterThanOrEqual)];
        assert_eq!(score(&a, &a, &gte, now, now), 1.0);
        assert_eq!(score(&a, &b, &gte, now, now), 0.0);
    }

    #[test]
    fn test_string_operators() {
        let now = Utc::now();
        let a = attrs(&[("tag", json!("eu-west-1"))]);
        let b = attrs(&[("tag", json!("eu"))]);
        let c = attrs(&[("tag", json!("-1"))]);

        let starts = vec![Criterion::new("tag", CriterionOperator::StartsWith)];
        let ends = vec![Criterion::new("tag", CriterionOperator::EndsWith)];
        let contains = vec![Criterion::new("tag", CriterionOperator::Contains)];

        assert_eq!(score(&a, &b, &starts, now, now), 1.0);
        assert_eq!(score(&a, &c, &ends, now, now), 1.0);
        assert_eq!(score(&a, &c, &contains, now, now), 1.0);
        assert_eq!(score(&b, &a, &contains, now, now), 0.0);
    }

    #[test]
    fn test_range_linear_falloff() {
        let now = Utc::now();
        let criteria = vec![Criterion::range("skill", 20.0)];
        let a = attrs(&[("skill", json!(100))]);
        let b = attrs(&[("skill", json!(110))]);
        // allowed 20, diff 10 -> half weight
        assert!((score(&a, &b, &criteria, now, now) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_range_tolerance_grows_then_caps() {
        let start = Utc::now();
        let criterion = Criterion::range("skill", 10.0);

        assert_eq!(allowed_tolerance(&criterion, 0.0), 10.0);
        assert!((allowed_tolerance(&criterion, 5.0) - 15.0).abs() < 1e-9);
        assert_eq!(allowed_tolerance(&criterion, 10.0), 20.0);
        assert_eq!(allowed_tolerance(&criterion, 60.0), 20.0);

        let criteria = vec![criterion];
        let a = attrs(&[("skill", json!(100))]);
        let b = attrs(&[("skill", json!(140))]);
        for minutes in [0, 5, 10, 30] {
            let now = start + Duration::minutes(minutes);
            assert_eq!(score(&a, &b, &criteria, start, now), 0.0);
        }
    }

    #[test]
    fn test_range_max_expansion_overrides_growth() {
        let now = Utc::now();
        let criteria = vec![Criterion::range("skill", 10.0).with_max_expansion(50.0)];
        let a = attrs(&[("skill", json!(100))]);
        let b = attrs(&[("skill", json!(140))]);
        assert!(score(&a, &b, &criteria, now, now) > 0.0);
    }

    #[test]
    fn test_zero_tolerance_requires_exact_value() {
        let now = Utc::now();
        let criteria = vec![Criterion::range("skill", 10.0).with_max_expansion(0.0)];
        let a = attrs(&[("skill", json!(100))]);
        assert_eq!(score(&a, &a, &criteria, now, now), 1.0);
        let b = attrs(&[("skill", json!(101))]);
        assert_eq!(score(&a, &b, &criteria, now, now), 0.0);
    }

    #[test]
    fn test_range_non_numeric_falls_back_to_equality() {
        let now = Utc::now();
        let criteria = vec![Criterion::range("tier", 10.0)];
        let a = attrs(&[("tier", json!("gold"))]);
        let b = attrs(&[("tier", json!("gold"))]);
        assert_eq!(score(&a, &b, &criteria, now, now), 1.0);
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            (-1000i64..1000).prop_map(|n| json!(n)),
            (-1000.0f64..1000.0).prop_map(|n| json!(n)),
            "[a-c]{0,3}".prop_map(|s| json!(s)),
        ]
    }

    fn operator_strategy() -> impl Strategy<Value = CriterionOperator> {
        prop_oneof![
            Just(CriterionOperator::Equal),
            Just(CriterionOperator::LessThan),
            Just(CriterionOperator::LessThanOrEqual),
            Just(CriterionOperator::GreaterThan),
            Just(CriterionOperator::GreaterThanOrEqual),
            Just(CriterionOperator::Contains),
            Just(CriterionOperator::StartsWith),
            Just(CriterionOperator::EndsWith),
            Just(CriterionOperator::Range),
        ]
    }

    fn criterion_for(op: CriterionOperator, rate: f64) -> Criterion {
        if op == CriterionOperator::Range {
            Criterion::range("k", rate)
        } else {
            Criterion::new("k", op)
        }
    }

    proptest! {
        #[test]
        fn prop_score_in_unit_interval(
            a in value_strategy(),
            b in value_strategy(),
            op in operator_strategy(),
            rate in 0.1f64..500.0,
            minutes in 0i64..120,
        ) {
            let start = Utc::now();
            let now = start + Duration::minutes(minutes);
            let criteria = vec![criterion_for(op, rate)];
            let s = score(&attrs(&[("k", a)]), &attrs(&[("k", b)]), &criteria, start, now);
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn prop_symmetric_operators_are_symmetric(
            a in value_strategy(),
            b in value_strategy(),
            rate in 0.1f64..500.0,
        ) {
            let now = Utc::now();
            for criterion in [Criterion::equal("k"), Criterion::range("k", rate)] {
                let criteria = vec![criterion];
                let left = attrs(&[("k", a.clone())]);
                let right = attrs(&[("k", b.clone())]);
                let ab = score(&left, &right, &criteria, now, now);
                let ba = score(&right, &left, &criteria, now, now);
                prop_assert!((ab - ba).abs() < 1e-9);
            }
        }

        #[test]
        fn prop_tolerance_monotone_and_capped(
            rate in 0.1f64..500.0,
            earlier in 0.0f64..60.0,
            extra in 0.0f64..60.0,
        ) {
            let criterion = Criterion::range("k", rate);
            let first = allowed_tolerance(&criterion, earlier);
            let second = allowed_tolerance(&criterion, earlier + extra);
            prop_assert!(second >= first);
            prop_assert!(second <= 2.0 * rate + 1e-9);
        }
    }
}
