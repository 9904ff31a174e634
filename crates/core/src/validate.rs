//! Structural validation of case definitions.
//!
//! Checks, in order:
//! 1. the root is the only `case_plan_model`
//! 2. only containers own children and sentries
//! 3. case/process tasks name a called element
//! 4. criteria reference sentries declared in their sentry scope
//! 5. on-part sources are children of the declaring container
//! 6. the sentry dependency graph is acyclic

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::definition::{ActivityDefinition, ActivityType, CaseDefinition};
use crate::error::DefinitionError;

pub(crate) fn validate_definition(def: &CaseDefinition) -> Result<(), DefinitionError> {
    let plan = def.plan_model();
    if plan.activity_type != ActivityType::CasePlanModel {
        return Err(DefinitionError::InvalidActivity {
            activity_id: plan.id.clone(),
            message: "root activity must be a case_plan_model".to_string(),
        });
    }
    if plan.has_entry_criteria() {
        return Err(DefinitionError::InvalidActivity {
            activity_id: plan.id.clone(),
            message: "the case plan model cannot have entry criteria".to_string(),
        });
    }

    validate_activity(plan, true)?;
    validate_criteria(def)?;
    validate_on_part_sources(plan)?;
    detect_sentry_cycle(def)
}

fn validate_activity(activity: &ActivityDefinition, is_root: bool) -> Result<(), DefinitionError> {
    if !is_root && activity.activity_type == ActivityType::CasePlanModel {
        return Err(DefinitionError::InvalidActivity {
            activity_id: activity.id.clone(),
            message: "case_plan_model is only allowed at the root".to_string(),
        });
    }
    if !activity.activity_type.is_container()
        && (!activity.children.is_empty() || !activity.sentries.is_empty())
    {
        return Err(DefinitionError::InvalidActivity {
            activity_id: activity.id.clone(),
            message: format!(
                "{} cannot own child activities or sentries",
                activity.activity_type.as_str()
            ),
        });
    }
    if activity.activity_type.calls_definition() && activity.called_element.is_none() {
        return Err(DefinitionError::MissingCalledElement {
            activity_id: activity.id.clone(),
        });
    }
    let mut sentry_ids = HashSet::new();
    for sentry in &activity.sentries {
        if !sentry_ids.insert(sentry.id.as_str()) {
            return Err(DefinitionError::DuplicateSentry {
                activity_id: activity.id.clone(),
                sentry_id: sentry.id.clone(),
            });
        }
    }
    for child in &activity.children {
        validate_activity(child, false)?;
    }
    Ok(())
}

fn validate_criteria(def: &CaseDefinition) -> Result<(), DefinitionError> {
    let mut ids: Vec<&str> = def.activity_ids().collect();
    ids.sort_unstable();
    for activity_id in ids {
        let (Some(activity), Some(scope)) =
            (def.activity(activity_id), def.sentry_scope(activity_id))
        else {
            continue;
        };
        let referenced = activity
            .entry_criteria
            .iter()
            .map(String::as_str)
            .chain(activity.exit_criteria.iter().map(|c| c.sentry.as_str()));
        for sentry_id in referenced {
            if scope.sentry(sentry_id).is_none() {
                return Err(DefinitionError::UnknownSentry {
                    activity_id: activity.id.clone(),
                    sentry_id: sentry_id.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn validate_on_part_sources(container: &ActivityDefinition) -> Result<(), DefinitionError> {
    let children: HashSet<&str> = container.children.iter().map(|c| c.id.as_str()).collect();
    for sentry in &container.sentries {
        for on_part in &sentry.on_parts {
            if !children.contains(on_part.source.as_str()) {
                return Err(DefinitionError::UnknownOnPartSource {
                    sentry_id: sentry.id.clone(),
                    source_id: on_part.source.clone(),
                });
            }
        }
    }
    for child in &container.children {
        validate_on_part_sources(child)?;
    }
    Ok(())
}

// ── Sentry dependency cycle detection ─────────────────────────────────────────

/// Build `source activity -> gated activity` edges: an activity depends on
/// every on-part source of every sentry it uses as an entry or exit criterion.
fn sentry_edges(def: &CaseDefinition) -> BTreeMap<&str, BTreeSet<&str>> {
    let mut edges: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for activity_id in def.activity_ids() {
        let (Some(activity), Some(scope)) =
            (def.activity(activity_id), def.sentry_scope(activity_id))
        else {
            continue;
        };
        let referenced = activity
            .entry_criteria
            .iter()
            .map(String::as_str)
            .chain(activity.exit_criteria.iter().map(|c| c.sentry.as_str()));
        for sentry_id in referenced {
            if let Some(sentry) = scope.sentry(sentry_id) {
                for on_part in &sentry.on_parts {
                    edges
                        .entry(on_part.source.as_str())
                        .or_default()
                        .insert(activity.id.as_str());
                }
            }
        }
    }
    edges
}

fn detect_sentry_cycle(def: &CaseDefinition) -> Result<(), DefinitionError> {
    let edges = sentry_edges(def);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_path: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();

    for &start in edges.keys() {
        if !visited.contains(start) {
            dfs_sentry_edges(start, &edges, &mut visited, &mut in_path, &mut path)?;
        }
    }
    Ok(())
}

fn dfs_sentry_edges<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, BTreeSet<&'a str>>,
    visited: &mut HashSet<&'a str>,
    in_path: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Result<(), DefinitionError> {
    path.push(node);
    in_path.insert(node);

    if let Some(targets) = edges.get(node) {
        for &target in targets {
            if in_path.contains(target) {
                let start = path.iter().position(|&s| s == target).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(target);
                return Err(DefinitionError::SentryCycle {
                    path: cycle.join(" \u{2192} "),
                });
            }
            if !visited.contains(target) {
                dfs_sentry_edges(target, edges, visited, in_path, path)?;
            }
        }
    }

    in_path.remove(node);
    visited.insert(node);
    path.pop();
    Ok(())
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use crate::definition::CaseDefinition;
    use crate::error::DefinitionError;
    use serde_json::json;

    fn build(plan: serde_json::Value) -> Result<CaseDefinition, DefinitionError> {
        CaseDefinition::from_json(
            &json!({ "id": "c:1", "key": "c", "plan_model": plan }).to_string(),
        )
    }

    #[test]
    fn unknown_sentry_reference_is_rejected() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ { "id": "a", "type": "task", "entry_criteria": ["nope"] } ]
        }))
        .unwrap_err();
        assert!(
            matches!(err, DefinitionError::UnknownSentry { sentry_id, .. } if sentry_id == "nope")
        );
    }

    #[test]
    fn on_part_source_must_be_a_sibling() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "sentries": [ { "id": "S", "on_parts": [ { "source": "ghost", "standard_event": "complete" } ] } ],
            "children": [ { "id": "a", "type": "task", "entry_criteria": ["S"] } ]
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::UnknownOnPartSource { source_id, .. } if source_id == "ghost"
        ));
    }

    #[test]
    fn tasks_cannot_own_children() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ { "id": "a", "type": "task", "children": [ { "id": "b", "type": "task" } ] } ]
        }))
        .unwrap_err();
        assert!(
            matches!(err, DefinitionError::InvalidActivity { activity_id, .. } if activity_id == "a")
        );
    }

    #[test]
    fn case_task_requires_called_element() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "children": [ { "id": "sub", "type": "case_task" } ]
        }))
        .unwrap_err();
        assert!(matches!(err, DefinitionError::MissingCalledElement { .. }));
    }

    #[test]
    fn mutual_entry_criteria_form_a_cycle() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "sentries": [
                { "id": "SA", "on_parts": [ { "source": "b", "standard_event": "complete" } ] },
                { "id": "SB", "on_parts": [ { "source": "a", "standard_event": "complete" } ] }
            ],
            "children": [
                { "id": "a", "type": "task", "entry_criteria": ["SA"] },
                { "id": "b", "type": "task", "entry_criteria": ["SB"] }
            ]
        }))
        .unwrap_err();
        match err {
            DefinitionError::SentryCycle { path } => {
                assert!(path.contains('a') && path.contains('b'), "{path}");
            }
            other => panic!("expected SentryCycle, got {other:?}"),
        }
    }

    #[test]
    fn self_referencing_exit_criterion_is_a_cycle() {
        let err = build(json!({
            "id": "plan", "type": "case_plan_model",
            "sentries": [ { "id": "S", "on_parts": [ { "source": "a", "standard_event": "suspend" } ] } ],
            "children": [ { "id": "a", "type": "task", "exit_criteria": [ { "sentry": "S" } ] } ]
        }))
        .unwrap_err();
        assert!(matches!(err, DefinitionError::SentryCycle { .. }));
    }

    #[test]
    fn chain_of_sentries_is_accepted() {
        let def = build(json!({
            "id": "plan", "type": "case_plan_model",
            "sentries": [
                { "id": "S1", "on_parts": [ { "source": "a", "standard_event": "complete" } ] },
                { "id": "S2", "on_parts": [ { "source": "b", "standard_event": "complete" } ] }
            ],
            "children": [
                { "id": "a", "type": "task" },
                { "id": "b", "type": "task", "entry_criteria": ["S1"] },
                { "id": "c", "type": "task", "exit_criteria": [ { "sentry": "S2", "action": "complete" } ] }
            ]
        }));
        assert!(def.is_ok(), "{:?}", def.err());
    }
}
