use std::collections::HashMap;

use serde_json::{Map, Value};

use skillflow_core::types::{MergeStrategy, SkillResult};

use crate::plan::ExecutionPlan;

/// Fold `results` into `prior` under `strategy`.
///
/// `results` must already be in declared order; completion order never
/// matters. Failed and timed-out results contribute nothing.
pub fn merge(
    prior: &Map<String, Value>,
    results: &[&SkillResult],
    strategy: MergeStrategy,
) -> Map<String, Value> {
    let mut merged = prior.clone();
    for result in results {
        if !result.is_success() {
            continue;
        }
        let Some(output) = result.output.as_ref() else {
            continue;
        };
        match strategy {
            MergeStrategy::MergeDeep => deep_merge(&mut merged, output),
            MergeStrategy::FirstWins => {
                for (key, value) in output {
                    if !merged.contains_key(key) {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            MergeStrategy::LastWins => overlay(&mut merged, output),
        }
    }
    merged
}

/// Recursive structural merge. Objects merge key by key; anything else
/// in `update` replaces what is in `base`.
pub fn deep_merge(base: &mut Map<String, Value>, update: &Map<String, Value>) {
    for (key, value) in update {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Top-level overwrite: every key in `overlay` replaces the base value.
pub fn overlay(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        base.insert(key.clone(), value.clone());
    }
}

/// Rebuild the merged result from scratch.
///
/// Takes the latest result of each skill in groups `< processed_groups`,
/// folds them in plan order, then applies the accumulated corrections.
pub fn recompute(
    plan: &ExecutionPlan,
    processed_groups: usize,
    skill_results: &[SkillResult],
    corrections: &Map<String, Value>,
) -> Map<String, Value> {
    let mut latest: HashMap<&str, &SkillResult> = HashMap::new();
    for result in skill_results {
        latest.insert(result.skill_id.as_str(), result);
    }

    let ordered: Vec<&SkillResult> = plan
        .groups
        .iter()
        .take(processed_groups)
        .flat_map(|g| g.skills.iter())
        .filter_map(|skill| latest.get(skill.id.as_str()).copied())
        .collect();

    let mut merged = merge(&Map::new(), &ordered, plan.merge_strategy);
    overlay(&mut merged, corrections);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::compile;
    use serde_json::json;
    use skillflow_core::types::{
        ErrorKind, SchemaDefinition, SkillDescriptor, SkillError, TokenUsage,
    };

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ok(id: &str, value: Value) -> SkillResult {
        SkillResult::succeeded(id, 1, obj(value), 1, TokenUsage::default())
    }

    fn failed(id: &str) -> SkillResult {
        SkillResult::failed(
            id,
            1,
            SkillError {
                kind: ErrorKind::Retryable,
                message: "503".into(),
            },
            3,
        )
    }

    #[test]
    fn merge_deep_combines_disjoint_outputs() {
        let a = ok("a", json!({"title": "A"}));
        let b = ok("b", json!({"summary": "B"}));
        let merged = merge(&Map::new(), &[&a, &b], MergeStrategy::MergeDeep);
        assert_eq!(Value::Object(merged), json!({"title": "A", "summary": "B"}));
    }

    #[test]
    fn merge_deep_recurses_and_later_declared_wins() {
        let a = ok("a", json!({"party": {"name": "Acme", "city": "Oslo"}, "total": 1}));
        let b = ok("b", json!({"party": {"city": "Bergen"}, "total": 2}));
        let merged = merge(&Map::new(), &[&a, &b], MergeStrategy::MergeDeep);
        assert_eq!(
            Value::Object(merged),
            json!({"party": {"name": "Acme", "city": "Bergen"}, "total": 2})
        );
    }

    #[test]
    fn merge_deep_scalar_replaces_object() {
        let a = ok("a", json!({"x": {"y": 1}}));
        let b = ok("b", json!({"x": "flat"}));
        let merged = merge(&Map::new(), &[&a, &b], MergeStrategy::MergeDeep);
        assert_eq!(merged["x"], json!("flat"));
    }

    #[test]
    fn first_wins_only_fills_missing_keys() {
        let prior = obj(json!({"title": "from-group-1"}));
        let a = ok("a", json!({"title": "late", "date": "2024-01-01"}));
        let b = ok("b", json!({"date": "2025-01-01", "total": 9}));
        let merged = merge(&prior, &[&a, &b], MergeStrategy::FirstWins);
        assert_eq!(
            Value::Object(merged),
            json!({"title": "from-group-1", "date": "2024-01-01", "total": 9})
        );
    }

    #[test]
    fn last_wins_overwrites_whole_keys() {
        let a = ok("a", json!({"party": {"name": "Acme", "city": "Oslo"}}));
        let b = ok("b", json!({"party": {"city": "Bergen"}}));
        let merged = merge(&Map::new(), &[&a, &b], MergeStrategy::LastWins);
        assert_eq!(Value::Object(merged), json!({"party": {"city": "Bergen"}}));
    }

    #[test]
    fn failed_results_contribute_nothing() {
        let a = ok("a", json!({"title": "A"}));
        let b = failed("b");
        let merged = merge(&Map::new(), &[&a, &b], MergeStrategy::MergeDeep);
        assert_eq!(Value::Object(merged), json!({"title": "A"}));
    }

    #[test]
    fn recompute_uses_latest_result_and_plan_order() {
        let plan = compile(
            &SchemaDefinition::new("s", "1")
                .with_skill(SkillDescriptor::new("a"))
                .with_skill(SkillDescriptor::new("b"))
                .with_skill(SkillDescriptor::new("c").with_group(2)),
        )
        .unwrap();

        // c finished first, b failed then succeeded on a retry round.
        let results = vec![
            ok("a", json!({"v": "a"})),
            failed("b"),
            ok("c", json!({"v": "c"})),
            ok("b", json!({"v": "b", "extra": true})),
        ];
        let corrections = obj(json!({"extra": false}));
        let merged = recompute(&plan, 2, &results, &corrections);
        assert_eq!(Value::Object(merged), json!({"v": "c", "extra": false}));
    }

    #[test]
    fn recompute_skips_unprocessed_groups() {
        let plan = compile(
            &SchemaDefinition::new("s", "1")
                .with_skill(SkillDescriptor::new("a"))
                .with_skill(SkillDescriptor::new("b").with_group(2)),
        )
        .unwrap();
        let results = vec![ok("a", json!({"a": 1})), ok("b", json!({"b": 2}))];
        let merged = recompute(&plan, 1, &results, &Map::new());
        assert_eq!(Value::Object(merged), json!({"a": 1}));
    }
}
