use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use skillflow_core::error::{Result, SkillflowError};
use skillflow_core::types::{
    MergeStrategy, RuleKind, SchemaDefinition, SkillAvailability, SkillDescriptor, ValidationRule,
};

/// Skills that share a group number, in declared schema order.
#[derive(Debug, Clone, Serialize)]
pub struct PlanGroup {
    pub number: u32,
    pub skills: Vec<SkillDescriptor>,
}

/// Ordered, validated execution plan compiled from a schema.
///
/// Groups are non-empty and strictly ascending by `number`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub schema_id: String,
    pub version: String,
    pub groups: Vec<PlanGroup>,
    pub merge_strategy: MergeStrategy,
    pub validation_rules: Vec<ValidationRule>,
    pub human_review: Option<bool>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, index: usize) -> Option<&PlanGroup> {
        self.groups.get(index)
    }

    pub fn last_group(&self) -> Option<&PlanGroup> {
        self.groups.last()
    }

    pub fn skill_count(&self) -> usize {
        self.groups.iter().map(|g| g.skills.len()).sum()
    }

    /// Whether blocking validation failures pause for review.
    pub fn human_review_enabled(&self, engine_default: bool) -> bool {
        self.human_review.unwrap_or(engine_default)
    }
}

/// Compile a schema definition into an execution plan.
///
/// Collects every violation before failing so authors can fix a schema
/// in one pass. Disabled and draft skills are validated but left out.
pub fn compile(schema: &SchemaDefinition) -> Result<ExecutionPlan> {
    let mut violations = Vec::new();

    if schema.schema_id.trim().is_empty() {
        violations.push("schema_id must not be empty".to_string());
    }

    let mut seen_ids = HashSet::new();
    let mut reported_dupes = HashSet::new();
    for (pos, skill) in schema.skills.iter().enumerate() {
        check_skill(pos, skill, &mut seen_ids, &mut reported_dupes, &mut violations);
    }

    let mut seen_rules = HashSet::new();
    for rule in &schema.validation_rules {
        check_rule(rule, &mut seen_rules, &mut violations);
    }

    let active: Vec<&SkillDescriptor> = schema
        .skills
        .iter()
        .filter(|s| s.status == SkillAvailability::Active)
        .collect();
    if active.is_empty() {
        violations.push("schema has no active skills".to_string());
    }

    if !violations.is_empty() {
        return Err(SkillflowError::SchemaInvalid {
            schema_id: schema.schema_id.clone(),
            violations,
        });
    }

    // BTreeMap keeps groups ascending; Vec push keeps declared order inside a group.
    let mut by_group: BTreeMap<u32, Vec<SkillDescriptor>> = BTreeMap::new();
    for skill in active {
        by_group
            .entry(skill.group as u32)
            .or_default()
            .push(skill.clone());
    }

    Ok(ExecutionPlan {
        schema_id: schema.schema_id.clone(),
        version: schema.version.clone(),
        groups: by_group
            .into_iter()
            .map(|(number, skills)| PlanGroup { number, skills })
            .collect(),
        merge_strategy: schema.merge_strategy,
        validation_rules: schema.validation_rules.clone(),
        human_review: schema.human_review,
    })
}

fn check_skill(
    pos: usize,
    skill: &SkillDescriptor,
    seen_ids: &mut HashSet<String>,
    reported_dupes: &mut HashSet<String>,
    violations: &mut Vec<String>,
) {
    let label = if skill.id.trim().is_empty() {
        violations.push(format!("skill #{}: id must not be empty", pos + 1));
        format!("#{}", pos + 1)
    } else {
        if !seen_ids.insert(skill.id.clone()) && reported_dupes.insert(skill.id.clone()) {
            violations.push(format!("duplicate skill id '{}'", skill.id));
        }
        format!("'{}'", skill.id)
    };

    if skill.group < 1 {
        violations.push(format!("skill {}: group must be >= 1 (got {})", label, skill.group));
    } else if skill.group > u32::MAX as i64 {
        violations.push(format!("skill {}: group {} is out of range", label, skill.group));
    }
    if skill.max_retries < 0 {
        violations.push(format!(
            "skill {}: max_retries must be >= 0 (got {})",
            label, skill.max_retries
        ));
    }
    if skill.timeout_ms == 0 {
        violations.push(format!("skill {}: timeout must be > 0", label));
    }
}

fn check_rule(rule: &ValidationRule, seen: &mut HashSet<String>, violations: &mut Vec<String>) {
    if rule.id.trim().is_empty() {
        violations.push("validation rule id must not be empty".to_string());
    } else if !seen.insert(rule.id.clone()) {
        violations.push(format!("duplicate validation rule id '{}'", rule.id));
    }

    match &rule.kind {
        RuleKind::Required { fields } if fields.is_empty() => {
            violations.push(format!("rule '{}': required rule lists no fields", rule.id));
        }
        RuleKind::SumCheck {
            operands,
            tolerance,
            ..
        } => {
            if operands.is_empty() {
                violations.push(format!("rule '{}': sum_check lists no operands", rule.id));
            }
            if !(*tolerance >= 0.0) {
                violations.push(format!("rule '{}': tolerance must be >= 0", rule.id));
            }
        }
        RuleKind::RangeCheck {
            min: Some(min),
            max: Some(max),
            ..
        } if min > max => {
            violations.push(format!("rule '{}': min {} exceeds max {}", rule.id, min, max));
        }
        _ => {}
    }
}
