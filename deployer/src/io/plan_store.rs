//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;

use crate::core::plan::validate_plan;
use crate::core::types::Plan;
use crate::io::config::write_atomic;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

static PLAN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(PLAN_SCHEMA).expect("embedded plan schema should be valid JSON");
    jsonschema::validator_for(&schema).expect("embedded plan schema should compile")
});

/// Load and validate a plan from disk (schema + invariants).
///
/// `.toml` files are parsed as TOML, anything else as JSON.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    let value: Value = if is_toml(path) {
        toml::from_str(&contents).with_context(|| format!("parse plan {}", path.display()))?
    } else {
        serde_json::from_str(&contents).with_context(|| format!("parse plan {}", path.display()))?
    };
    validate_schema(&value).with_context(|| format!("validate plan {}", path.display()))?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", path.display()))?;
    let errors = validate_plan(&plan);
    if !errors.is_empty() {
        return Err(anyhow!(
            "plan invariants failed in {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    Ok(plan)
}

/// Write a plan as pretty JSON or TOML, chosen by extension.
pub fn write_plan(path: &Path, plan: &Plan) -> Result<()> {
    let mut buf = if is_toml(path) {
        toml::to_string_pretty(plan).context("serialize plan toml")?
    } else {
        serde_json::to_string_pretty(plan).context("serialize plan json")?
    };
    buf.push('\n');
    write_atomic(path, &buf)
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

fn validate_schema(plan: &Value) -> Result<()> {
    if PLAN_VALIDATOR.is_valid(plan) {
        return Ok(());
    }
    let messages = PLAN_VALIDATOR
        .iter_errors(plan)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(anyhow!("plan schema validation failed: {}", messages.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StepCategory;
    use crate::test_support::{plan, step, step_with_deps};

    #[test]
    fn loads_toml_plan_with_aliases_and_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.toml");
        fs::write(
            &path,
            r#"strategy = "docker"

[[steps]]
id = 1
name = "Install Docker"
category = "prerequisite"
description = "Make sure docker is available"

[[steps]]
id = 2
name = "Start stack"
goal = "docker compose up -d"
success_criteria = "containers healthy"
depends_on = [1]
"#,
        )
        .expect("write");

        let plan = load_plan(&path).expect("load");
        assert_eq!(plan.strategy, "docker");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].category, StepCategory::Prerequisite);
        assert_eq!(plan.steps[0].goal, "Make sure docker is available");
        assert_eq!(plan.steps[0].criteria(), "Complete: Install Docker");
        assert!(plan.steps[1].depends_on.contains(&1));
    }

    #[test]
    fn schema_violation_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        fs::write(&path, r#"{"steps": [{"id": "one", "name": "x", "goal": "y"}]}"#)
            .expect("write");
        let err = load_plan(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("plan schema validation failed"));
    }

    #[test]
    fn invariant_violations_are_reported_together() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        write_plan(&path, &plan(vec![step_with_deps(1, &[2]), step(2), step(2)])).expect("write");
        let err = format!("{:#}", load_plan(&path).expect_err("should fail"));
        assert!(err.contains("duplicate step id 2"), "{err}");
        assert!(err.contains("comes later in the plan"), "{err}");
    }

    #[test]
    fn json_write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plan.json");
        let original = plan(vec![step(1), step_with_deps(2, &[1])]);
        write_plan(&path, &original).expect("write");
        assert_eq!(load_plan(&path).expect("load"), original);
    }
}
