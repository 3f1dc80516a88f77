//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, InfraConfig, ValidationResult};
use crate::graph::ResourceGraph;
use crate::planner::{ActionOutcome, ActionType, Plan};
use crate::reconciler::ApplyReport;
use crate::state::{LockInfo, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Attributes")]
    attributes: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Apply outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure matches the configuration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan {}\n", short(&plan.fingerprint()).dimmed());

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .filter(|a| a.action_type != ActionType::NoOp)
            .map(|a| PlanActionRow {
                index: a.index + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.key.to_string(),
                after: a
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&a.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push('\n');
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "  {} {}", action.action_type.symbol(), action.key);
                for change in &action.changes {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Delete).to_string().red(),
            plan.count(ActionType::NoOp)
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let status = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let rows: Vec<OutcomeRow> = report
                    .execution
                    .results
                    .iter()
                    .filter(|r| r.action_type != ActionType::NoOp)
                    .map(|r| OutcomeRow {
                        action: Self::format_action_type(r.action_type),
                        resource: r.key.to_string(),
                        outcome: Self::format_outcome(&r.outcome),
                    })
                    .collect();
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push_str("\n\n");
                }

                let _ = writeln!(output, "   Created: {}", report.created);
                let _ = writeln!(output, "   Updated: {}", report.updated);
                let _ = writeln!(output, "   Deleted: {}", report.deleted);
                let _ = writeln!(output, "   Unchanged: {}", report.unchanged);
                if report.failed + report.blocked + report.cancelled > 0 {
                    let _ = writeln!(output, "   Failed: {}", report.failed);
                    let _ = writeln!(output, "   Blocked: {}", report.blocked);
                    let _ = writeln!(output, "   Cancelled: {}", report.cancelled);
                }

                if !report.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &report.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats the result of `validate`.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &InfraConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        let hasher = ConfigHasher::new();
        let hash = hasher.hash_config(config);
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "config_hash": hash,
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resources.len(),
                "providers": config.providers.len(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let _ = writeln!(output, "   Providers: {}", config.providers.len());
                let _ = writeln!(output, "   Config hash: {}", hasher.short_hash(&hash));
                output
            }
        }
    }

    /// Formats the dependency graph as levels.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let levels: Vec<Vec<String>> = graph
            .levels()
            .iter()
            .map(|level| {
                level
                    .iter()
                    .filter_map(|&i| graph.node(i).map(|n| n.key().to_string()))
                    .collect()
            })
            .collect();

        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "levels": levels,
                "edges": graph
                    .edges()
                    .iter()
                    .filter_map(|&(from, to)| Some((graph.node(from)?.key(), graph.node(to)?.key())))
                    .map(|(from, to)| [from.to_string(), to.to_string()])
                    .collect::<Vec<_>>(),
            })),
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("No resources declared.\n");
                }
                let mut output = String::new();
                for (depth, level) in levels.iter().enumerate() {
                    let _ = writeln!(output, "{} {}", format!("[{depth}]").dimmed(), level.join(", "));
                }
                output
            }
        }
    }

    /// Formats the list of state records.
    #[must_use]
    pub fn format_records(&self, snapshot: &StateSnapshot, location: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&snapshot.records().collect::<Vec<_>>()),
            OutputFormat::Text => {
                let mut output = format!("\nState: {location}\n\n");
                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }
                let rows: Vec<RecordRow> = snapshot
                    .records()
                    .map(|r| RecordRow {
                        resource: r.key().to_string(),
                        provider_id: Self::truncate(&r.provider_id, 36),
                        attributes: r.attributes.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats one state record.
    #[must_use]
    pub fn format_record(&self, record: &StateRecord) -> String {
        match self.format {
            OutputFormat::Json => to_json(record),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "{}", record.key().to_string().bold());
                let _ = writeln!(output, "   Provider ID: {}", record.provider_id);
                let _ = writeln!(output, "   Created: {}", record.created_at);
                let _ = writeln!(output, "   Updated: {}", record.updated_at);
                if !record.dependencies.is_empty() {
                    let deps: Vec<String> =
                        record.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                output.push_str("   Attributes:\n");
                for (name, value) in &record.attributes {
                    let marker = if record.declared.contains(name) { " " } else { "*" };
                    let _ = writeln!(output, "    {marker} {name} = {value}");
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, lock) => to_json(&lock),
            (OutputFormat::Text, None) => String::from("State is not locked.\n"),
            (OutputFormat::Text, Some(lock)) => format!(
                "State locked by {} for {} (lock {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats an action outcome with color.
    fn format_outcome(outcome: &ActionOutcome) -> String {
        match outcome {
            ActionOutcome::Applied => "applied".green().to_string(),
            ActionOutcome::Unchanged => "unchanged".dimmed().to_string(),
            ActionOutcome::Failed { error } => format!("{} {error}", "failed:".red()),
            ActionOutcome::Blocked { by } => format!("{} by #{}", "blocked".yellow(), by + 1),
            ActionOutcome::Cancelled => "cancelled".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": status, "message": message }))
            }
            OutputFormat::Text => text.to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    fingerprint: String,
    has_changes: bool,
    creates: usize,
    updates: usize,
    deletes: usize,
    unchanged: usize,
    actions: &'a [crate::planner::PlanAction],
}

impl<'a> From<&'a Plan> for PlanJson<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            fingerprint: plan.fingerprint(),
            has_changes: plan.has_changes(),
            creates: plan.count(ActionType::Create),
            updates: plan.count(ActionType::Update),
            deletes: plan.count(ActionType::Delete),
            unchanged: plan.count(ActionType::NoOp),
            actions: &plan.actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;

    fn plan() -> Plan {
        let graph = GraphBuilder::new()
            .build(vec![
                ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
                ResourceSpec::new("vm", "vm").with_reference("subnet_id", "net.id"),
            ])
            .unwrap();
        DiffEngine::new().plan(&graph, &StateSnapshot::new())
    }

    #[test]
    fn test_plan_json_lists_actions() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_plan(&plan(), false)).unwrap();
        assert_eq!(json["creates"], 2);
        assert_eq!(json["actions"][1]["key"]["name"], "vm");
        assert_eq!(json["actions"][1]["dependencies"][0], 0);
    }

    #[test]
    fn test_plan_text_shows_unknown_values() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&plan(), true);
        assert!(text.contains("subnet_id: (known after apply)"));
        assert!(text.contains("Plan: 2 to create, 0 to update, 0 to delete"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }
}
