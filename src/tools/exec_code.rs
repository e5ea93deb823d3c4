//! `exec_code`: run code in the conversation's kernel and wait for it

use serde_json::{json, Value};

use super::error_envelope;
use crate::execution::{Execution, ExecutionEngine, ExecutionStatus};
use crate::tools::Workspace;

pub async fn exec_code(
    engine: &ExecutionEngine,
    conversation_id: &str,
    workspace: Option<&Workspace>,
    code: &str,
) -> Value {
    let Some(workspace) = workspace else {
        return error_envelope("no workspace selected; choose a workspace before executing code");
    };

    let execution_id = engine
        .execute(conversation_id, code, Some(workspace.root()))
        .await;

    match engine.wait(&execution_id).await {
        Some(record) => summarize(&record),
        None => error_envelope(format!("execution {execution_id} disappeared")),
    }
}

/// Tool result for a settled execution
pub fn summarize(record: &Execution) -> Value {
    let status = if record.status == ExecutionStatus::Completed {
        "success"
    } else {
        "error"
    };
    json!({
        "status": status,
        "execution_status": record.status,
        "execution_id": record.id,
        "output": record.sorted_output(),
        "image_count": record.images.len(),
        "image_descriptions": image_descriptions(record),
        "error": record.error,
    })
}

/// What the vision model saw in each figure, by capture index
fn image_descriptions(record: &Execution) -> Vec<Value> {
    record
        .images
        .iter()
        .enumerate()
        .filter_map(|(index, image)| {
            image
                .description
                .as_ref()
                .map(|description| json!({ "index": index, "description": description }))
        })
        .collect()
}
