//! Semantic plan invariants beyond the JSON Schema.

use std::collections::BTreeSet;

use crate::core::types::Plan;

/// Validate plan invariants, returning every violation found.
///
/// - at least one step
/// - step ids are unique
/// - names and goals are non-empty
/// - every dependency exists, is not the step itself, and appears earlier
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.steps.is_empty() {
        errors.push("plan has no steps".to_string());
    }

    let mut seen = BTreeSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id) {
            errors.push(format!("duplicate step id {}", step.id));
        }
        if step.name.trim().is_empty() {
            errors.push(format!("step {} has an empty name", step.id));
        }
        if step.goal.trim().is_empty() {
            errors.push(format!("step {} has an empty goal", step.id));
        }
    }

    let all: BTreeSet<_> = plan.steps.iter().map(|s| s.id).collect();
    let mut earlier = BTreeSet::new();
    for step in &plan.steps {
        for dep in &step.depends_on {
            if *dep == step.id {
                errors.push(format!("step {} depends on itself", step.id));
            } else if !all.contains(dep) {
                errors.push(format!("step {} depends on unknown step {}", step.id, dep));
            } else if !earlier.contains(dep) {
                errors.push(format!(
                    "step {} depends on step {} which comes later in the plan",
                    step.id, dep
                ));
            }
        }
        earlier.insert(step.id);
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan, step, step_with_deps};

    #[test]
    fn valid_plan_has_no_errors() {
        let plan = plan(vec![step(1), step_with_deps(2, &[1]), step_with_deps(3, &[1, 2])]);
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let mut bad = step(2);
        bad.name = " ".to_string();
        let plan = plan(vec![
            step_with_deps(1, &[3]),
            bad,
            step_with_deps(2, &[2]),
            step_with_deps(4, &[9]),
            step(3),
        ]);
        let errors = validate_plan(&plan);
        assert!(errors.contains(&"duplicate step id 2".to_string()));
        assert!(errors.contains(&"step 2 has an empty name".to_string()));
        assert!(errors.contains(&"step 2 depends on itself".to_string()));
        assert!(errors.contains(&"step 4 depends on unknown step 9".to_string()));
        assert!(
            errors.contains(&"step 1 depends on step 3 which comes later in the plan".to_string())
        );
    }

    #[test]
    fn empty_plan_is_invalid() {
        assert_eq!(validate_plan(&plan(Vec::new())), vec!["plan has no steps".to_string()]);
    }
}
