//! Read-only execution query criteria.
//!
//! Backends turn an [`ExecutionQuery`] into a result list. The in-memory
//! backend evaluates it directly with [`ExecutionQuery::matches`] and
//! [`ExecutionQuery::apply_ordering`]; SQL backends translate the fields.

use std::cmp::Ordering;

use arbor_core::ExecutionState;
use serde::{Deserialize, Serialize};

use crate::record::{ExecutionRecord, VariableRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryProperty {
    ExecutionId,
    DefinitionId,
    DefinitionKey,
    TenantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOrdering {
    pub property: QueryProperty,
    pub direction: Direction,
}

/// Matches executions that hold a local variable `name` equal to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariablePredicate {
    pub name: String,
    pub value: serde_json::Value,
}

/// Query for execution records. All criteria are conjunctive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub execution_id: Option<String>,
    pub case_instance_id: Option<String>,
    pub activity_id: Option<String>,
    pub state: Option<ExecutionState>,
    pub tenant_ids: Option<Vec<String>>,
    pub without_tenant_id: bool,
    pub business_key: Option<String>,
    pub case_definition_id: Option<String>,
    pub case_definition_key: Option<String>,
    pub variables: Vec<VariablePredicate>,
    pub ordering: Vec<QueryOrdering>,
}

impl ExecutionQuery {
    pub fn builder() -> ExecutionQueryBuilder {
        ExecutionQueryBuilder::default()
    }

    /// Check a record against every criterion. `variables` returns the local
    /// variables of an execution; it is only called when the query has
    /// variable predicates.
    pub fn matches<F>(&self, record: &ExecutionRecord, variables: F) -> bool
    where
        F: Fn(&str) -> Vec<VariableRecord>,
    {
        if let Some(ref id) = self.execution_id {
            if &record.id != id {
                return false;
            }
        }
        if let Some(ref case_instance_id) = self.case_instance_id {
            if &record.case_instance_id != case_instance_id {
                return false;
            }
        }
        if let Some(ref activity_id) = self.activity_id {
            if &record.activity_id != activity_id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        if let Some(ref tenant_ids) = self.tenant_ids {
            match record.tenant_id {
                Some(ref tenant) if tenant_ids.contains(tenant) => {}
                _ => return false,
            }
        }
        if self.without_tenant_id && record.tenant_id.is_some() {
            return false;
        }
        if let Some(ref business_key) = self.business_key {
            if record.business_key.as_ref() != Some(business_key) {
                return false;
            }
        }
        if let Some(ref definition_id) = self.case_definition_id {
            if &record.case_definition_id != definition_id {
                return false;
            }
        }
        if let Some(ref definition_key) = self.case_definition_key {
            if &record.case_definition_key != definition_key {
                return false;
            }
        }
        if !self.variables.is_empty() {
            let locals = variables(&record.id);
            let all_match = self.variables.iter().all(|predicate| {
                locals
                    .iter()
                    .any(|v| v.name == predicate.name && v.value == predicate.value)
            });
            if !all_match {
                return false;
            }
        }
        true
    }

    /// Sort by the requested orderings, then by id for a stable result.
    pub fn apply_ordering(&self, records: &mut [ExecutionRecord]) {
        records.sort_by(|a, b| {
            for ordering in &self.ordering {
                let cmp = compare_property(a, b, ordering.property);
                let cmp = match ordering.direction {
                    Direction::Ascending => cmp,
                    Direction::Descending => cmp.reverse(),
                };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a.id.cmp(&b.id)
        });
    }
}

fn compare_property(a: &ExecutionRecord, b: &ExecutionRecord, property: QueryProperty) -> Ordering {
    match property {
        QueryProperty::ExecutionId => a.id.cmp(&b.id),
        QueryProperty::DefinitionId => a.case_definition_id.cmp(&b.case_definition_id),
        QueryProperty::DefinitionKey => a.case_definition_key.cmp(&b.case_definition_key),
        // Executions without a tenant sort first.
        QueryProperty::TenantId => a.tenant_id.cmp(&b.tenant_id),
    }
}

/// Builder for execution queries.
///
/// `asc()` / `desc()` set the direction of the most recent `order_by_*`.
#[derive(Debug, Default)]
pub struct ExecutionQueryBuilder {
    query: ExecutionQuery,
}

impl ExecutionQueryBuilder {
    pub fn execution_id(mut self, id: impl Into<String>) -> Self {
        self.query.execution_id = Some(id.into());
        self
    }

    pub fn case_instance_id(mut self, id: impl Into<String>) -> Self {
        self.query.case_instance_id = Some(id.into());
        self
    }

    pub fn activity_id(mut self, id: impl Into<String>) -> Self {
        self.query.activity_id = Some(id.into());
        self
    }

    pub fn state(mut self, state: ExecutionState) -> Self {
        self.query.state = Some(state);
        self
    }

    pub fn tenant_id_in<I, T>(mut self, tenant_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.query.tenant_ids = Some(tenant_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_tenant_id(mut self) -> Self {
        self.query.without_tenant_id = true;
        self
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.query.business_key = Some(key.into());
        self
    }

    pub fn case_definition_id(mut self, id: impl Into<String>) -> Self {
        self.query.case_definition_id = Some(id.into());
        self
    }

    pub fn case_definition_key(mut self, key: impl Into<String>) -> Self {
        self.query.case_definition_key = Some(key.into());
        self
    }

    pub fn variable_value_equals(
        mut self,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.query.variables.push(VariablePredicate {
            name: name.into(),
            value,
        });
        self
    }

    pub fn order_by_execution_id(self) -> Self {
        self.order_by(QueryProperty::ExecutionId)
    }

    pub fn order_by_definition_id(self) -> Self {
        self.order_by(QueryProperty::DefinitionId)
    }

    pub fn order_by_definition_key(self) -> Self {
        self.order_by(QueryProperty::DefinitionKey)
    }

    pub fn order_by_tenant_id(self) -> Self {
        self.order_by(QueryProperty::TenantId)
    }

    pub fn asc(self) -> Self {
        self.direction(Direction::Ascending)
    }

    pub fn desc(self) -> Self {
        self.direction(Direction::Descending)
    }

    pub fn build(self) -> ExecutionQuery {
        self.query
    }

    fn order_by(mut self, property: QueryProperty) -> Self {
        self.query.ordering.push(QueryOrdering {
            property,
            direction: Direction::Ascending,
        });
        self
    }

    fn direction(mut self, direction: Direction) -> Self {
        if let Some(last) = self.query.ordering.last_mut() {
            last.direction = direction;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{ActivityType, DefinitionKind};
    use serde_json::json;

    fn record(id: &str, tenant: Option<&str>, key: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            revision: 1,
            parent_id: None,
            case_instance_id: id.to_string(),
            case_definition_id: format!("{key}:1"),
            case_definition_key: key.to_string(),
            kind: DefinitionKind::Case,
            business_key: Some(format!("bk-{id}")),
            activity_id: "plan".to_string(),
            activity_name: None,
            activity_type: ActivityType::CasePlanModel,
            activity_description: None,
            state: ExecutionState::Active,
            previous_state: None,
            tenant_id: tenant.map(str::to_string),
            super_execution_id: None,
            sub_execution_id: None,
            super_case_execution_id: None,
            sub_case_instance_id: None,
            required: false,
            sequence_counter: 1,
        }
    }

    fn no_vars(_: &str) -> Vec<VariableRecord> {
        Vec::new()
    }

    #[test]
    fn tenant_criteria() {
        let a = record("a", Some("t1"), "loan");
        let b = record("b", None, "loan");

        let in_t1 = ExecutionQuery::builder().tenant_id_in(["t1", "t2"]).build();
        assert!(in_t1.matches(&a, no_vars));
        assert!(!in_t1.matches(&b, no_vars));

        let without = ExecutionQuery::builder().without_tenant_id().build();
        assert!(!without.matches(&a, no_vars));
        assert!(without.matches(&b, no_vars));
    }

    #[test]
    fn variable_predicate_uses_local_variables() {
        let a = record("a", None, "loan");
        let query = ExecutionQuery::builder()
            .variable_value_equals("amount", json!(100))
            .build();
        let vars = |scope: &str| {
            vec![VariableRecord {
                id: "v1".into(),
                revision: 1,
                name: "amount".into(),
                value: json!(100),
                scope_id: scope.to_string(),
                case_instance_id: scope.to_string(),
                sequence_counter: 1,
            }]
        };
        assert!(query.matches(&a, vars));
        assert!(!query.matches(&a, no_vars));
    }

    #[test]
    fn ordering_by_tenant_desc_then_id() {
        let mut records = vec![
            record("c", Some("t1"), "loan"),
            record("a", Some("t2"), "loan"),
            record("b", Some("t1"), "claim"),
        ];
        let query = ExecutionQuery::builder().order_by_tenant_id().desc().build();
        query.apply_ordering(&mut records);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let query = ExecutionQuery::builder().order_by_definition_key().build();
        query.apply_ordering(&mut records);
        assert_eq!(records[0].case_definition_key, "claim");

        let query = ExecutionQuery::builder().order_by_definition_id().desc().build();
        query.apply_ordering(&mut records);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }
}
