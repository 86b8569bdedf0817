//! Structural plan validation.
//!
//! Validation runs exactly once per plan, before any step executes, and any
//! reported error is fatal for the run. Each rule lives in its own
//! `check_*` function collected by [`validate`].

use std::collections::{BTreeMap, HashMap, HashSet};

use super::model::ExecutionPlan;
use super::ValidationError;

/// Run every structural check and collect the failures.
pub fn validate(plan: &ExecutionPlan) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    check_unique_ids(plan, &mut errors);
    check_edge_targets(plan, &mut errors);
    check_incoming_edges(plan, &mut errors);
    check_cycles(plan, &mut errors);
    check_start(plan, &mut errors);
    check_end(plan, &mut errors);
    errors
}

fn check_unique_ids(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStep(step.id.clone()));
        }
    }
}

fn check_edge_targets(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    let ids: HashSet<&str> = plan.steps.iter().map(|step| step.id.as_str()).collect();
    for step in &plan.steps {
        for target in step.next.keys() {
            if !ids.contains(target.as_str()) {
                errors.push(ValidationError::UnknownTarget {
                    step: step.id.clone(),
                    target: target.clone(),
                });
            }
        }
    }
}

/// No step may have more than one incoming edge; the plan is a forest.
fn check_incoming_edges(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
    for step in &plan.steps {
        for target in step.next.keys() {
            *incoming.entry(target.as_str()).or_default() += 1;
        }
    }
    for (target, count) in incoming {
        if count > 1 {
            errors.push(ValidationError::MultipleDependencies(target.to_string()));
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Cycle detection by DFS coloring. A back edge from `a` to `b` reports the
/// unordered pair once.
fn check_cycles(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    let mut colors: HashMap<&str, Color> = plan
        .steps
        .iter()
        .map(|step| (step.id.as_str(), Color::White))
        .collect();
    let mut reported: HashSet<(String, String)> = HashSet::new();

    for step in &plan.steps {
        if colors.get(step.id.as_str()) == Some(&Color::White) {
            visit(plan, &step.id, &mut colors, &mut reported, errors);
        }
    }
}

fn visit<'a>(
    plan: &'a ExecutionPlan,
    id: &str,
    colors: &mut HashMap<&'a str, Color>,
    reported: &mut HashSet<(String, String)>,
    errors: &mut Vec<ValidationError>,
) {
    let Some(step) = plan.step(id) else {
        return;
    };
    colors.insert(&step.id, Color::Gray);
    for target in step.next.keys() {
        match colors.get(target.as_str()) {
            Some(Color::Gray) => {
                let pair = unordered(id, target);
                if reported.insert(pair.clone()) {
                    errors.push(ValidationError::CircularDependency(pair.0, pair.1));
                }
            }
            Some(Color::White) => visit(plan, target, colors, reported, errors),
            _ => {}
        }
    }
    if let Some(step) = plan.step(id) {
        colors.insert(&step.id, Color::Black);
    }
}

fn unordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn check_start(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    if let Err(err) = resolve_start(plan) {
        errors.push(err);
    }
}

fn check_end(plan: &ExecutionPlan, errors: &mut Vec<ValidationError>) {
    if let Err(err) = resolve_end(plan) {
        errors.push(err);
    }
}

/// Resolve the step execution starts from: the explicit override when set,
/// otherwise the unique step with no incoming edge.
pub fn resolve_start(plan: &ExecutionPlan) -> Result<String, ValidationError> {
    if let Some(start) = &plan.options.start {
        return match plan.step(start) {
            Some(step) => Ok(step.id.clone()),
            None => Err(ValidationError::StartNotFound),
        };
    }

    let targets: HashSet<&str> = plan
        .steps
        .iter()
        .flat_map(|step| step.next.keys())
        .map(String::as_str)
        .collect();
    let mut roots = plan
        .steps
        .iter()
        .filter(|step| !targets.contains(step.id.as_str()))
        .map(|step| step.id.clone());

    match (roots.next(), roots.next()) {
        (Some(root), None) => Ok(root),
        (Some(_), Some(_)) => Err(ValidationError::AmbiguousStart),
        (None, _) => Err(ValidationError::NoStart),
    }
}

/// Resolve the optional end pattern to exactly one step.
pub fn resolve_end(plan: &ExecutionPlan) -> Result<Option<String>, ValidationError> {
    let Some(pattern) = &plan.options.end else {
        return Ok(None);
    };
    let mut matches = plan
        .steps
        .iter()
        .filter(|step| step.id == *pattern || step.id.starts_with(pattern.as_str()))
        .map(|step| step.id.clone());

    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok(Some(id)),
        (Some(_), Some(_)) => Err(ValidationError::AmbiguousEnd),
        (None, _) => Err(ValidationError::EndNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{Edge, PlanOptions, Step};

    fn step(id: &str, body: Option<&str>, next: &[(&str, Edge)]) -> Step {
        Step {
            id: id.to_string(),
            name: None,
            adaptor: None,
            body: body.map(str::to_string),
            configuration: None,
            initial_state: None,
            next: next
                .iter()
                .map(|(target, edge)| (target.to_string(), edge.clone()))
                .collect(),
        }
    }

    fn plan(steps: Vec<Step>) -> ExecutionPlan {
        ExecutionPlan {
            id: "p".to_string(),
            steps,
            options: PlanOptions::default(),
        }
    }

    #[test]
    fn accepts_a_clean_forest() {
        let plan = plan(vec![
            step("t", None, &[("a", Edge::always())]),
            step(
                "a",
                Some("[]"),
                &[("x", Edge::on_success("a")), ("y", Edge::on_success("a"))],
            ),
            step("x", Some("[]"), &[]),
            step("y", Some("[]"), &[]),
        ]);
        assert!(validate(&plan).is_empty());
        assert_eq!(resolve_start(&plan).unwrap(), "t");
    }

    #[test]
    fn reports_cycles_as_unordered_pairs() {
        let plan = plan(vec![
            step("a", Some("[]"), &[("b", Edge::always())]),
            step("b", Some("[]"), &[("a", Edge::always())]),
        ]);
        let errors = validate(&plan);
        let rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert!(
            rendered
                .iter()
                .any(|message| message == "circular dependency: a <-> b"),
            "got {rendered:?}"
        );
    }

    #[test]
    fn finds_cycles_deep_in_a_chain() {
        let plan = plan(vec![
            step("t", None, &[("a", Edge::always())]),
            step("a", Some("[]"), &[("b", Edge::always())]),
            step("b", Some("[]"), &[("c", Edge::always())]),
            step("c", Some("[]"), &[("b", Edge::always())]),
        ]);
        let rendered: Vec<String> =
            validate(&plan).iter().map(ToString::to_string).collect();
        assert!(
            rendered
                .iter()
                .any(|message| message == "circular dependency: b <-> c"),
            "got {rendered:?}"
        );
    }

    #[test]
    fn reports_multiple_incoming_edges() {
        let plan = plan(vec![
            step("t", None, &[("j", Edge::always())]),
            step("u", None, &[("j", Edge::always())]),
            step("j", Some("[]"), &[]),
        ]);
        let rendered: Vec<String> = validate(&plan).iter().map(ToString::to_string).collect();
        assert!(
            rendered
                .iter()
                .any(|message| message == "multiple dependencies detected for: j"),
            "got {rendered:?}"
        );
    }

    #[test]
    fn explicit_start_must_exist() {
        let mut p = plan(vec![step("a", Some("[]"), &[])]);
        p.options.start = Some("missing".to_string());
        assert_eq!(
            resolve_start(&p).unwrap_err().to_string(),
            "start step not found"
        );
    }

    #[test]
    fn ambiguous_end_pattern_is_an_error() {
        let mut p = plan(vec![
            step("t", None, &[("job-1", Edge::always())]),
            step("job-1", Some("[]"), &[("job-2", Edge::on_success("job-1"))]),
            step("job-2", Some("[]"), &[]),
        ]);
        p.options.end = Some("job".to_string());
        assert_eq!(
            resolve_end(&p).unwrap_err().to_string(),
            "end pattern matched multiple steps"
        );
        p.options.end = Some("job-2".to_string());
        assert_eq!(resolve_end(&p).unwrap(), Some("job-2".to_string()));
    }

    #[test]
    fn unknown_edge_target_is_reported() {
        let plan = plan(vec![step("t", None, &[("ghost", Edge::always())])]);
        let errors = validate(&plan);
        let err = errors
            .iter()
            .find(|err| matches!(err, ValidationError::UnknownTarget { .. }))
            .unwrap_or_else(|| panic!("got {errors:?}"));
        assert_eq!(
            err.to_string(),
            "edge from t references unknown step ghost"
        );
    }
}
