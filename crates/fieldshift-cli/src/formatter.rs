//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::Table;
use fieldshift_core::migration::{MigrationDecision, MigrationJob, MigrationPreview};
use fieldshift_core::DependencyGraph;
use serde_json::{json, Value};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format a classification decision.
    fn format_decision(&self, decision: &MigrationDecision) -> String;

    /// Format a dependency graph.
    fn format_graph(&self, graph: &DependencyGraph) -> String;

    /// Format a migration preview.
    fn format_preview(&self, preview: &MigrationPreview) -> String;

    /// Format a list of migration jobs.
    fn format_jobs(&self, jobs: &[MigrationJob]) -> String;

    /// Format the ids of purged fields.
    fn format_purged(&self, field_ids: &[u64]) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_decision(&self, decision: &MigrationDecision) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Property", "Value"]);
        table.add_row(vec!["decision", decision.label()]);
        table.add_row(vec!["risk".to_string(), decision.risk().to_string()]);

        match decision {
            MigrationDecision::Denied {
                reason,
                explanation,
                alternatives,
            } => {
                table.add_row(vec!["reason", reason.as_str()]);
                table.add_row(vec!["explanation", explanation.as_str()]);
                for alternative in alternatives {
                    table.add_row(vec!["alternative", alternative.as_str()]);
                }
            }
            MigrationDecision::Safe {
                auto_convert,
                description,
            } => {
                table.add_row(vec!["auto_convert".to_string(), auto_convert.to_string()]);
                table.add_row(vec!["description", description.as_str()]);
            }
            MigrationDecision::Risky {
                data_loss,
                warning,
                requires_preview,
                ..
            } => {
                table.add_row(vec!["data_loss".to_string(), data_loss.to_string()]);
                table.add_row(vec!["warning", warning.as_str()]);
                table.add_row(vec![
                    "requires_preview".to_string(),
                    requires_preview.to_string(),
                ]);
            }
        }

        table.to_string()
    }

    fn format_graph(&self, graph: &DependencyGraph) -> String {
        let mut table = Table::new();
        table.set_header(vec!["Field", "Depends on", "Dependents"]);
        for (slug, dependencies) in graph.forward() {
            let dependents = graph.dependents_of(slug);
            table.add_row(vec![
                slug.clone(),
                join(dependencies.iter()),
                join(dependents.iter()),
            ]);
        }

        let mut output = table.to_string();
        if graph.cycles().is_empty() {
            output.push_str("\nNo cycles");
        } else {
            for cycle in graph.cycles() {
                output.push_str(&format!("\nCycle: {}", cycle.join(" -> ")));
            }
        }
        output
    }

    fn format_preview(&self, preview: &MigrationPreview) -> String {
        let assessment = &preview.risk_assessment;
        let mut summary = Table::new();
        summary.set_header(vec!["Property", "Value"]);
        summary.add_row(vec!["field_id".to_string(), preview.field_id.to_string()]);
        summary.add_row(vec!["decision", assessment.decision.label()]);
        summary.add_row(vec!["risk_level".to_string(), assessment.risk_level.to_string()]);
        summary.add_row(vec![
            "affected_records".to_string(),
            assessment.affected_record_estimate.to_string(),
        ]);
        summary.add_row(vec![
            "sample_failures".to_string(),
            assessment.sample_failures.to_string(),
        ]);
        for detail in &assessment.details {
            summary.add_row(vec!["detail", detail.as_str()]);
        }

        if preview.samples.is_empty() {
            return format!("{}\nNo sample records", summary);
        }

        let mut samples = Table::new();
        samples.set_header(vec!["Record", "Before", "After", "Ok", "Note"]);
        for sample in &preview.samples {
            samples.add_row(vec![
                sample.record_id.to_string(),
                sample.before.to_string(),
                sample
                    .after
                    .as_ref()
                    .map(Value::to_string)
                    .unwrap_or_else(|| "-".to_string()),
                sample.success.to_string(),
                sample.note.clone().unwrap_or_default(),
            ]);
        }

        format!("{}\n{}", summary, samples)
    }

    fn format_jobs(&self, jobs: &[MigrationJob]) -> String {
        if jobs.is_empty() {
            return "No migration jobs".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec![
            "Job", "Operation", "Field", "Type", "Status", "Processed", "Migrated", "Failed",
        ]);
        for job in jobs {
            table.add_row(vec![
                job.job_id.to_string(),
                job.operation_id.to_string(),
                job.field_id.to_string(),
                job.migration_type.clone(),
                job.status.to_string(),
                format!("{}/{}", job.processed, job.total),
                job.migrated.to_string(),
                job.failed.to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_purged(&self, field_ids: &[u64]) -> String {
        if field_ids.is_empty() {
            "No fields past their scheduled delete time".to_string()
        } else {
            format!("Purged {} field(s): {}", field_ids.len(), join(field_ids.iter()))
        }
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_decision(&self, decision: &MigrationDecision) -> String {
        pretty(&decision_to_json(decision))
    }

    fn format_graph(&self, graph: &DependencyGraph) -> String {
        pretty(&json!({
            "forward": graph.forward(),
            "reverse": graph.reverse(),
            "cycles": graph.cycles(),
        }))
    }

    fn format_preview(&self, preview: &MigrationPreview) -> String {
        let assessment = &preview.risk_assessment;
        let samples: Vec<Value> = preview
            .samples
            .iter()
            .map(|sample| {
                json!({
                    "record_id": sample.record_id,
                    "before": sample.before,
                    "after": sample.after,
                    "success": sample.success,
                    "note": sample.note,
                })
            })
            .collect();

        pretty(&json!({
            "field_id": preview.field_id,
            "risk_assessment": {
                "decision": decision_to_json(&assessment.decision),
                "risk_level": assessment.risk_level.to_string(),
                "affected_record_estimate": assessment.affected_record_estimate,
                "sample_failures": assessment.sample_failures,
                "details": assessment.details,
            },
            "samples": samples,
        }))
    }

    fn format_jobs(&self, jobs: &[MigrationJob]) -> String {
        let jobs: Vec<Value> = jobs
            .iter()
            .map(|job| {
                json!({
                    "job_id": job.job_id,
                    "operation_id": job.operation_id,
                    "pipeline_id": job.pipeline_id,
                    "field_id": job.field_id,
                    "migration_type": job.migration_type,
                    "source_slug": job.source_slug,
                    "target_slug": job.target_slug,
                    "status": job.status.to_string(),
                    "processed": job.processed,
                    "total": job.total,
                    "migrated": job.migrated,
                    "failed": job.failed,
                })
            })
            .collect();
        pretty(&Value::Array(jobs))
    }

    fn format_purged(&self, field_ids: &[u64]) -> String {
        json!({ "purged": field_ids }).to_string()
    }
}

fn decision_to_json(decision: &MigrationDecision) -> Value {
    match decision {
        MigrationDecision::Denied {
            reason,
            explanation,
            alternatives,
        } => json!({
            "decision": "denied",
            "reason": reason,
            "explanation": explanation,
            "alternatives": alternatives,
        }),
        MigrationDecision::Safe {
            auto_convert,
            description,
        } => json!({
            "decision": "safe",
            "auto_convert": auto_convert,
            "description": description,
        }),
        MigrationDecision::Risky {
            data_loss,
            risk,
            warning,
            requires_preview,
        } => json!({
            "decision": "risky",
            "data_loss": data_loss.to_string(),
            "risk": risk.to_string(),
            "warning": warning,
            "requires_preview": requires_preview,
        }),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

fn join<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let parts: Vec<String> = items.map(|item| item.to_string()).collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}
