//! Final output assembly.

use tracing::warn;

use crate::{
    executor::StepRecord,
    template::TemplateContext,
    types::{OutputFormat, OutputSpec, StepStatus, WorkflowStatus, WorkflowStep},
};

const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Assemble the workflow's final text.
///
/// `merged` joins the non-errored step texts in workflow (declaration)
/// order; an `include` list restricts the set but does not reorder it.
/// `custom` renders the output template against the final context and
/// falls back to `merged` when the template itself fails to resolve.
/// A failed workflow always ends with a `Workflow "«name»" failed: …`
/// line after whatever partial output exists.
pub fn assemble_output(
    name: &str,
    status: WorkflowStatus,
    steps: &[WorkflowStep],
    records: &[StepRecord],
    spec: &OutputSpec,
    context: &TemplateContext,
) -> String {
    let body = match spec.format {
        OutputFormat::Merged => merged_text(steps, records, spec.include.as_deref()),
        OutputFormat::Last => last_text(steps, records),
        OutputFormat::Custom => match &spec.template {
            Some(template) => match context.expand(template) {
                Ok(rendered) => rendered,
                Err(err) => {
                    warn!("output template for '{}' failed ({}), using merged", name, err);
                    merged_text(steps, records, spec.include.as_deref())
                }
            },
            None => merged_text(steps, records, spec.include.as_deref()),
        },
    };

    if status != WorkflowStatus::Failed {
        return body;
    }
    let reason = records
        .iter()
        .rev()
        .find(|record| record.status == StepStatus::Failed)
        .map(|record| {
            format!(
                "step '{}': {}",
                record.id,
                record.error.as_deref().unwrap_or("unknown error")
            )
        })
        .unwrap_or_else(|| "execution halted".to_string());
    let failure = format!("Workflow \"{name}\" failed: {reason}");
    if body.is_empty() {
        failure
    } else {
        format!("{body}\n\n{failure}")
    }
}

fn merged_text(steps: &[WorkflowStep], records: &[StepRecord], include: Option<&[String]>) -> String {
    let mut parts = Vec::new();
    // Declaration order, not level order.
    for step in steps {
        if let Some(include) = include {
            if !include.contains(&step.id) {
                continue;
            }
        }
        let Some(record) = records.iter().find(|record| record.id == step.id) else {
            continue;
        };
        if record.status != StepStatus::Succeeded {
            continue;
        }
        if let Some(result) = &record.result {
            if !result.text.is_empty() {
                parts.push(result.text.clone());
            }
        }
    }
    parts.join(MERGE_SEPARATOR)
}

fn last_text(steps: &[WorkflowStep], records: &[StepRecord]) -> String {
    steps
        .iter()
        .rev()
        .filter_map(|step| records.iter().find(|record| record.id == step.id))
        .find(|record| record.status == StepStatus::Succeeded)
        .and_then(|record| record.result.as_ref())
        .map(|result| result.text.clone())
        .unwrap_or_default()
}
