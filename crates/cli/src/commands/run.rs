use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process;

use arbor_engine::{CaseEngine, CreateCaseInstance, EngineConfig};
use arbor_storage::{ExecutionRecord, MemoryStorage};
use serde::Serialize;
use serde_json::Value;

use crate::commands::validate::load_definition;
use crate::script::{parse_script, Step, StepCommand};
use crate::{report_error, OutputFormat};

pub(crate) struct RunArgs {
    pub definition: PathBuf,
    pub script: PathBuf,
    pub config: Option<PathBuf>,
    pub business_key: Option<String>,
    pub tenant: Option<String>,
}

/// One row of the printed tree.
#[derive(Debug, Serialize)]
struct NodeView {
    id: String,
    activity_id: String,
    activity_type: &'static str,
    state: &'static str,
    depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_case_instance_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunOutput {
    case_instance_id: String,
    steps: usize,
    deleted: bool,
    tree: Vec<NodeView>,
    variables: BTreeMap<String, Value>,
}

/// Deploy the definition into an in-memory engine, create one instance and
/// apply every step of the script to it.
pub(crate) async fn cmd_run(args: RunArgs, output: OutputFormat, quiet: bool) {
    let config = match &args.config {
        Some(path) => {
            EngineConfig::load(path).unwrap_or_else(|e| fail(&e.to_string(), output, quiet))
        }
        None => EngineConfig::default(),
    };
    let definition = load_definition(&args.definition, output, quiet);
    let script = std::fs::read_to_string(&args.script).unwrap_or_else(|e| {
        let msg = format!("error reading file '{}': {}", args.script.display(), e);
        fail(&msg, output, quiet)
    });
    let steps = parse_script(&script).unwrap_or_else(|e| {
        let msg = format!("invalid script '{}': {}", args.script.display(), e);
        fail(&msg, output, quiet)
    });

    let engine = CaseEngine::builder(MemoryStorage::new())
        .config(config)
        .build();
    let definition = engine
        .deploy(definition)
        .unwrap_or_else(|e| fail(&e.to_string(), output, quiet));

    let mut request = CreateCaseInstance::by_id(definition.id());
    if let Some(key) = args.business_key {
        request = request.business_key(key);
    }
    if let Some(tenant) = args.tenant {
        request = request.tenant_id(tenant);
    }
    let case_instance_id = match engine.create_case_instance(request).await {
        Ok(created) => created.case_instance_id,
        Err(e) => fail(&format!("error creating case instance: {e}"), output, quiet),
    };
    tracing::info!(
        case_instance_id = %case_instance_id,
        definition = %definition.id(),
        "case instance created"
    );

    let mut deleted = false;
    for (index, step) in steps.iter().enumerate() {
        if let Err(e) = apply_step(&engine, &case_instance_id, step).await {
            fail(&format!("step {} ({}): {}", index + 1, step, e), output, quiet);
        }
        tracing::debug!(step = %step, "step applied");
        if step.command == StepCommand::Delete {
            deleted = true;
            break;
        }
    }

    let (tree, variables) = if deleted {
        (Vec::new(), BTreeMap::new())
    } else {
        let tree = match engine.tree(&case_instance_id).await {
            Ok(records) => view(&records),
            Err(e) => fail(&e.to_string(), output, quiet),
        };
        let variables = match engine.local_variables(&case_instance_id).await {
            Ok(vars) => vars,
            Err(e) => fail(&e.to_string(), output, quiet),
        };
        (tree, variables)
    };

    match output {
        OutputFormat::Json => {
            let result = RunOutput {
                case_instance_id,
                steps: steps.len(),
                deleted,
                tree,
                variables,
            };
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => fail(&format!("error serializing output: {e}"), output, quiet),
            }
        }
        OutputFormat::Text => {
            if !quiet {
                println!("case instance {} ({} steps)", case_instance_id, steps.len());
            }
            if deleted {
                println!("deleted");
                return;
            }
            for node in &tree {
                println!("{}{} [{}]", "  ".repeat(node.depth), node.activity_id, node.state);
            }
            for (name, value) in &variables {
                println!("{} = {}", name, value);
            }
        }
    }
}

fn fail(msg: &str, output: OutputFormat, quiet: bool) -> ! {
    report_error(msg, output, quiet);
    process::exit(1);
}

async fn apply_step(
    engine: &CaseEngine<MemoryStorage>,
    case_instance_id: &str,
    step: &Step,
) -> Result<(), String> {
    let target = resolve_target(engine, case_instance_id, step.activity.as_deref()).await?;

    let outcome = match step.command {
        StepCommand::SetVariable => {
            let name = step.variable_name()?;
            let value = step.value.clone().unwrap_or(Value::Null);
            engine.set_variable(&target, name, value).await
        }
        StepCommand::RemoveVariable => engine.remove_variable(&target, step.variable_name()?).await,
        StepCommand::Delete => engine.delete_case_instance(case_instance_id).await,
        command => match command.transition() {
            Some(transition) => engine.transition(&target, transition).await,
            None => return Err(format!("'{}' is not a transition", step)),
        },
    };
    outcome.map(|_| ()).map_err(|e| e.to_string())
}

/// Execution id for an activity of the instance; the instance itself when
/// no activity is named. A repeated activity resolves to its latest live
/// execution.
async fn resolve_target(
    engine: &CaseEngine<MemoryStorage>,
    case_instance_id: &str,
    activity: Option<&str>,
) -> Result<String, String> {
    let Some(activity) = activity else {
        return Ok(case_instance_id.to_string());
    };
    let tree = engine
        .tree(case_instance_id)
        .await
        .map_err(|e| e.to_string())?;
    let mut matches: Vec<&ExecutionRecord> =
        tree.iter().filter(|r| r.activity_id == activity).collect();
    if let Some(pos) = matches.iter().rposition(|r| !r.state.is_terminal()) {
        return Ok(matches.swap_remove(pos).id.clone());
    }
    matches
        .last()
        .map(|r| r.id.clone())
        .ok_or_else(|| format!("no execution of activity '{activity}'"))
}

fn view(records: &[ExecutionRecord]) -> Vec<NodeView> {
    let mut depths: HashMap<&str, usize> = HashMap::new();
    records
        .iter()
        .map(|record| {
            let depth = record
                .parent_id
                .as_deref()
                .and_then(|parent| depths.get(parent))
                .map_or(0, |d| d + 1);
            depths.insert(record.id.as_str(), depth);
            NodeView {
                id: record.id.clone(),
                activity_id: record.activity_id.clone(),
                activity_type: record.activity_type.as_str(),
                state: record.state.as_str(),
                depth,
                sub_case_instance_id: record.sub_case_instance_id.clone(),
            }
        })
        .collect()
}
