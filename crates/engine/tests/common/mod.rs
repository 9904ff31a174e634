//! Fixtures shared by the engine integration tests.

#![allow(dead_code)]

use arbor_core::{CaseDefinition, ExecutionState};
use arbor_engine::{CaseEngine, CreateCaseInstance, EngineConfig};
use arbor_storage::{ExecutionRecord, MemoryStorage};
use serde_json::Value;

pub fn engine() -> CaseEngine<MemoryStorage> {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> CaseEngine<MemoryStorage> {
    CaseEngine::builder(MemoryStorage::new()).config(config).build()
}

/// Deploy a definition whose plan model is `plan`.
pub fn deploy(engine: &CaseEngine<MemoryStorage>, key: &str, plan: Value) {
    deploy_model(
        engine,
        serde_json::json!({ "id": format!("{key}:1"), "key": key, "plan_model": plan }),
    );
}

pub fn deploy_model(engine: &CaseEngine<MemoryStorage>, model: Value) {
    let definition = CaseDefinition::from_json(&model.to_string()).unwrap();
    engine.deploy(definition).unwrap();
}

pub async fn create(engine: &CaseEngine<MemoryStorage>, key: &str) -> String {
    engine
        .create_case_instance(CreateCaseInstance::by_key(key))
        .await
        .unwrap()
        .case_instance_id
}

/// The single node of the instance running `activity_id`.
pub async fn node(
    engine: &CaseEngine<MemoryStorage>,
    case_instance_id: &str,
    activity_id: &str,
) -> ExecutionRecord {
    let tree = engine.tree(case_instance_id).await.unwrap();
    let mut matching = tree.into_iter().filter(|n| n.activity_id == activity_id);
    let found = matching
        .next()
        .unwrap_or_else(|| panic!("no node for activity {activity_id}"));
    assert!(matching.next().is_none(), "several nodes for {activity_id}");
    found
}

pub async fn state(
    engine: &CaseEngine<MemoryStorage>,
    case_instance_id: &str,
    activity_id: &str,
) -> ExecutionState {
    node(engine, case_instance_id, activity_id).await.state
}

/// `(activity id, state)` of every node, depth-first.
pub async fn shape(
    engine: &CaseEngine<MemoryStorage>,
    case_instance_id: &str,
) -> Vec<(String, ExecutionState)> {
    engine
        .tree(case_instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| (n.activity_id, n.state))
        .collect()
}
