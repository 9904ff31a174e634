//! Scripts for `arbor run`: a JSON list of steps applied in order to one
//! case instance.
//!
//! ```json
//! [
//!   { "command": "set_variable", "name": "approved", "value": true },
//!   { "command": "complete", "activity": "review" },
//!   { "command": "terminate" }
//! ]
//! ```
//!
//! A step without `activity` targets the case instance itself.

use std::fmt;

use arbor_core::Transition;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StepCommand {
    Start,
    ManualStart,
    Enable,
    Disable,
    Reenable,
    Complete,
    Occur,
    Terminate,
    Exit,
    Suspend,
    Resume,
    SetVariable,
    RemoveVariable,
    Delete,
}

impl StepCommand {
    pub fn transition(self) -> Option<Transition> {
        match self {
            StepCommand::Start => Some(Transition::Start),
            StepCommand::ManualStart => Some(Transition::ManualStart),
            StepCommand::Enable => Some(Transition::Enable),
            StepCommand::Disable => Some(Transition::Disable),
            StepCommand::Reenable => Some(Transition::Reenable),
            StepCommand::Complete => Some(Transition::Complete),
            StepCommand::Occur => Some(Transition::Occur),
            StepCommand::Terminate => Some(Transition::Terminate),
            StepCommand::Exit => Some(Transition::Exit),
            StepCommand::Suspend => Some(Transition::Suspend),
            StepCommand::Resume => Some(Transition::Resume),
            StepCommand::SetVariable | StepCommand::RemoveVariable | StepCommand::Delete => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Step {
    pub command: StepCommand,
    /// Activity id of the target node; the case instance when absent.
    #[serde(default)]
    pub activity: Option<String>,
    /// Variable name for `set_variable` / `remove_variable`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())?;
        if let Some(activity) = &self.activity {
            write!(f, " {activity}")?;
        }
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

impl Step {
    fn command_name(&self) -> &'static str {
        match self.command {
            StepCommand::Start => "start",
            StepCommand::ManualStart => "manual_start",
            StepCommand::Enable => "enable",
            StepCommand::Disable => "disable",
            StepCommand::Reenable => "reenable",
            StepCommand::Complete => "complete",
            StepCommand::Occur => "occur",
            StepCommand::Terminate => "terminate",
            StepCommand::Exit => "exit",
            StepCommand::Suspend => "suspend",
            StepCommand::Resume => "resume",
            StepCommand::SetVariable => "set_variable",
            StepCommand::RemoveVariable => "remove_variable",
            StepCommand::Delete => "delete",
        }
    }

    /// Variable name, required by the variable commands.
    pub fn variable_name(&self) -> Result<&str, String> {
        self.name
            .as_deref()
            .ok_or_else(|| format!("'{}' needs a \"name\"", self.command_name()))
    }
}

pub(crate) fn parse_script(json: &str) -> Result<Vec<Step>, serde_json::Error> {
    serde_json::from_str(json)
}
