use serde_json::{Map, Value};
use tracing::debug;

use skillflow_core::types::{RuleKind, ValidationOutcome, ValidationResult, ValidationRule};

/// Evaluate every rule against the merged result.
///
/// Rules never short-circuit each other; outcomes keep rule order.
pub fn validate(rules: &[ValidationRule], merged: &Map<String, Value>) -> ValidationResult {
    let outcomes: Vec<ValidationOutcome> = rules
        .iter()
        .map(|rule| {
            let (passed, message) = evaluate(&rule.kind, merged);
            debug!(rule_id = %rule.id, passed, "Validation rule evaluated");
            ValidationOutcome {
                rule_id: rule.id.clone(),
                passed,
                severity: rule.severity,
                message,
            }
        })
        .collect();
    ValidationResult::from_outcomes(outcomes)
}

fn evaluate(kind: &RuleKind, merged: &Map<String, Value>) -> (bool, String) {
    match kind {
        RuleKind::Required { fields } => check_required(fields, merged),
        RuleKind::SumCheck {
            operands,
            total,
            tolerance,
        } => check_sum(operands, total, *tolerance, merged),
        RuleKind::RangeCheck { field, min, max } => check_range(field, *min, *max, merged),
    }
}

fn check_required(fields: &[String], merged: &Map<String, Value>) -> (bool, String) {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|f| matches!(get_path(merged, f), None | Some(Value::Null)))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        (true, "All required fields present".to_string())
    } else {
        (false, format!("Missing required fields: {}", missing.join(", ")))
    }
}

fn check_sum(
    operands: &[String],
    total_field: &str,
    tolerance: f64,
    merged: &Map<String, Value>,
) -> (bool, String) {
    let mut sum = 0.0;
    for operand in operands {
        let (sign, path) = match operand.strip_prefix('-') {
            Some(rest) => (-1.0, rest),
            None => (1.0, operand.as_str()),
        };
        // Absent operands count as zero.
        match get_path(merged, path) {
            None | Some(Value::Null) => {}
            Some(value) => match as_number(value) {
                Some(n) => sum += sign * n,
                None => return (false, format!("Operand '{}' is not numeric", path)),
            },
        }
    }

    let total = match get_path(merged, total_field) {
        None | Some(Value::Null) => {
            return (false, format!("Total field '{}' not found", total_field));
        }
        Some(value) => match as_number(value) {
            Some(n) => n,
            None => return (false, format!("Total field '{}' is not numeric", total_field)),
        },
    };

    let diff = (sum - total).abs();
    if diff <= tolerance {
        (true, format!("Sum {} matches {} = {}", sum, total_field, total))
    } else {
        (
            false,
            format!(
                "Sum {} does not match {} = {} (difference {}, tolerance {})",
                sum, total_field, total, diff, tolerance
            ),
        )
    }
}

fn check_range(
    field: &str,
    min: Option<f64>,
    max: Option<f64>,
    merged: &Map<String, Value>,
) -> (bool, String) {
    let value = match get_path(merged, field) {
        None | Some(Value::Null) => {
            return (true, format!("Skipped: field '{}' not found", field));
        }
        Some(value) => value,
    };
    let Some(n) = as_number(value) else {
        return (false, format!("Field '{}' is not numeric", field));
    };

    if let Some(lo) = min {
        if n < lo {
            return (false, format!("{} = {} is below minimum {}", field, n, lo));
        }
    }
    if let Some(hi) = max {
        if n > hi {
            return (false, format!("{} = {} is above maximum {}", field, n, hi));
        }
    }
    (true, format!("{} = {} is within range", field, n))
}

/// Resolve a dot path (`address.city`) inside nested objects.
pub fn get_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Numbers, and strings that parse as numbers.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
