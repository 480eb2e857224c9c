//! Row steps backed by the tenant's document store.
//!
//! Rows are stored as documents with identifiers of the form `ro_<table>_<uuid>`, so a
//! table is a key range within the tenant partition.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::StepId;
use tracing::debug;
use uuid::Uuid;

use super::{StepCapability, StepContext, StepDescriptor, StepFamily, StepSchema, parse_inputs, to_outputs};
use crate::{
    error::StepExecutionError,
    store::{Document, RangeQuery, StoreError},
};

const ROW_PREFIX: &str = "ro_";

fn table_prefix(table_id: &str) -> String {
    format!("{ROW_PREFIX}{table_id}_")
}

fn new_row_identifier(table_id: &str) -> String {
    format!("{}{}", table_prefix(table_id), Uuid::new_v4().simple())
}

fn ensure_row_identifier(row_id: &str) -> Result<(), StepExecutionError> {
    if row_id.starts_with(ROW_PREFIX) {
        Ok(())
    } else {
        Err(StepExecutionError::Failed {
            message: format!("'{row_id}' is not a row identifier"),
        })
    }
}

/// Row as exposed to later steps: stored fields plus `_id` and `_rev`.
fn row_from_document(document: &Document) -> Value {
    let mut row = match &document.body {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    row.insert("_id".to_string(), Value::String(document.id.clone()));
    row.insert("_rev".to_string(), Value::from(document.revision));
    Value::Object(row)
}

fn strip_metadata(mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove("_id");
    fields.remove("_rev");
    fields
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RowOutputs {
    pub success: bool,
    pub id: String,
    pub row: Value,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CreateRowInputs {
    #[schemars(description = "Table the row belongs to.")]
    pub table_id: String,
    #[schemars(description = "Field values of the new row.")]
    pub row: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateRowStep;

#[async_trait]
impl StepCapability for CreateRowStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::CreateRow,
            name: "Create Row",
            description: "Adds a row to a table",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<CreateRowInputs, RowOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: CreateRowInputs = parse_inputs(StepId::CreateRow, inputs)?;
        let mut fields = strip_metadata(inputs.row);
        fields.insert("table_id".to_string(), Value::String(inputs.table_id.clone()));

        let document = Document::new(new_row_identifier(&inputs.table_id), Value::Object(fields));
        let stored = step_context
            .services
            .documents
            .put(step_context.tenant_id, document)
            .await?;
        debug!(tenant_id = %step_context.tenant_id, row_id = %stored.id, "row created");

        to_outputs(&RowOutputs {
            success: true,
            id: stored.id.clone(),
            row: row_from_document(&stored),
        })
    }
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateRowInputs {
    pub row_id: String,
    #[schemars(description = "Fields to merge into the existing row.")]
    pub row: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateRowStep;

#[async_trait]
impl StepCapability for UpdateRowStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::UpdateRow,
            name: "Update Row",
            description: "Updates fields of an existing row",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<UpdateRowInputs, RowOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: UpdateRowInputs = parse_inputs(StepId::UpdateRow, inputs)?;
        ensure_row_identifier(&inputs.row_id)?;

        let documents = &step_context.services.documents;
        let mut existing = documents
            .get(step_context.tenant_id, &inputs.row_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                doc_id: inputs.row_id.clone(),
            })?;
        let mut fields = match existing.body {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        for (field, value) in strip_metadata(inputs.row) {
            if field != "table_id" {
                fields.insert(field, value);
            }
        }
        existing.body = Value::Object(fields);

        let stored = documents.put(step_context.tenant_id, existing).await?;
        to_outputs(&RowOutputs {
            success: true,
            id: stored.id.clone(),
            row: row_from_document(&stored),
        })
    }
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeleteRowInputs {
    pub row_id: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteRowStep;

#[async_trait]
impl StepCapability for DeleteRowStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::DeleteRow,
            name: "Delete Row",
            description: "Deletes a row",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<DeleteRowInputs, RowOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: DeleteRowInputs = parse_inputs(StepId::DeleteRow, inputs)?;
        ensure_row_identifier(&inputs.row_id)?;
        let removed = step_context
            .services
            .documents
            .remove(step_context.tenant_id, &inputs.row_id)
            .await?;
        to_outputs(&RowOutputs {
            success: true,
            id: removed.id.clone(),
            row: row_from_document(&removed),
        })
    }
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueryRowsInputs {
    pub table_id: String,
    /// Field equality filters applied to every row.
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(JsonSchema, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueryRowsOutputs {
    pub success: bool,
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryRowsStep;

#[async_trait]
impl StepCapability for QueryRowsStep {
    fn descriptor(&self) -> StepDescriptor {
        StepDescriptor {
            step_id: StepId::QueryRows,
            name: "Query rows",
            description: "Lists rows of a table matching simple equality filters",
            family: StepFamily::Action,
            internal: false,
            can_loop: true,
            halts_on_failure: false,
        }
    }

    fn schema(&self) -> StepSchema {
        StepSchema::of::<QueryRowsInputs, QueryRowsOutputs>()
    }

    async fn run(&self, inputs: Map<String, Value>, step_context: &StepContext<'_>) -> Result<Value, StepExecutionError> {
        let inputs: QueryRowsInputs = parse_inputs(StepId::QueryRows, inputs)?;
        let documents = step_context
            .services
            .documents
            .all_docs(step_context.tenant_id, &RangeQuery::prefix(&table_prefix(&inputs.table_id)))
            .await?;

        // Table ids may contain '_', so `ro_people_` also prefixes `ro_people_archive_` rows.
        let rows: Vec<Value> = documents
            .iter()
            .filter(|document| document.body.get("table_id").and_then(Value::as_str) == Some(inputs.table_id.as_str()))
            .filter(|document| {
                inputs
                    .filters
                    .iter()
                    .all(|(field, expected)| document.body.get(field) == Some(expected))
            })
            .take(inputs.limit.unwrap_or(usize::MAX))
            .map(row_from_document)
            .collect();

        to_outputs(&QueryRowsOutputs { success: true, rows })
    }
}
