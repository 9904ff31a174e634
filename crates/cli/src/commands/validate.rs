use std::path::Path;
use std::process;

use arbor_core::CaseDefinition;

use crate::{report_error, OutputFormat};

/// Read a definition file; on failure report and exit.
pub(crate) fn load_definition(path: &Path, output: OutputFormat, quiet: bool) -> CaseDefinition {
    let json = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading file '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    match CaseDefinition::from_json(&json) {
        Ok(definition) => definition,
        Err(e) => {
            let msg = format!("invalid definition '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    }
}

pub(crate) fn cmd_validate(path: &Path, output: OutputFormat, quiet: bool) {
    let definition = load_definition(path, output, quiet);
    let activities = definition.activity_ids().count();
    let sentries: usize = definition
        .activity_ids()
        .filter_map(|id| definition.activity(id))
        .map(|a| a.sentries.len())
        .sum();

    match output {
        OutputFormat::Json => {
            let result = serde_json::json!({
                "valid": true,
                "id": definition.id(),
                "key": definition.key(),
                "version": definition.version(),
                "kind": definition.kind().as_str(),
                "activities": activities,
                "sentries": sentries,
            });
            println!("{}", result);
        }
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "valid: {} v{} ({} activities, {} sentries)",
                    definition.key(),
                    definition.version(),
                    activities,
                    sentries
                );
            }
        }
    }
}
