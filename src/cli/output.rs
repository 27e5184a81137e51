//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeclarationFile, ValidationResult};
use crate::model::ResourceAddress;
use crate::planner::{ActionKind, DependencyGraph, Plan, PlannedAction, ReplaceStrategy};
use crate::reconciler::{DriftReport, ReconciliationResult};
use crate::state::ObservedState;

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

/// State entry row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure matches the declarations.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan");
        let _ = writeln!(
            output,
            "   Declaration hash: {}",
            short(&plan.declaration_hash)
        );
        let _ = writeln!(output, "   State serial: {}\n", plan.state_serial);

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.kind != ActionKind::NoOp)
            .map(|(i, a)| PlanActionRow {
                index: i,
                action: Self::format_action(a),
                resource: a.address.to_string(),
                after: a
                    .dependencies
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: truncate(&a.reason, 50),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "   {} {}", Self::format_action(action), action.address);
                for change in &action.changes {
                    let line = format!("       {change}");
                    if change.forces_replacement {
                        let _ = writeln!(output, "{}", line.red());
                    } else {
                        let _ = writeln!(output, "{line}");
                    }
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to add, {} to change, {} to destroy ({} unchanged)",
            summary.to_add.to_string().green(),
            summary.to_change.to_string().yellow(),
            summary.to_destroy.to_string().red(),
            summary.unchanged
        );

        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        declarations: &DeclarationFile,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "project": declarations.qualified_name(),
                "resources": declarations.resources.len(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Declarations are valid", "✓".green());
                } else {
                    let _ = writeln!(
                        output,
                        "{} {} validation errors:",
                        "✗".red(),
                        result.error_count()
                    );
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && result.warning_count() > 0 {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                } else if result.warning_count() > 0 {
                    let _ = writeln!(
                        output,
                        "   {} warnings (use --warnings to show)",
                        result.warning_count()
                    );
                }

                let _ = writeln!(output, "\nDeclaration summary:");
                let _ = writeln!(output, "   Project: {}", declarations.project.name);
                let _ = writeln!(output, "   Environment: {}", declarations.project.environment);
                let _ = writeln!(output, "   Resources: {}", declarations.resources.len());
                output
            }
        }
    }

    /// Formats the dependency graph as waves.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph, levels: &[Vec<ResourceAddress>]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "levels": levels
                    .iter()
                    .map(|wave| wave.iter().map(ToString::to_string).collect::<Vec<_>>())
                    .collect::<Vec<_>>(),
                "edges": graph
                    .edges()
                    .iter()
                    .map(|e| serde_json::json!({
                        "from": e.from.to_string(),
                        "to": e.to.to_string(),
                        "kind": format!("{:?}", e.kind).to_lowercase(),
                    }))
                    .collect::<Vec<_>>(),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!(
                    "\nDependency graph: {} resources, {} edges\n",
                    graph.len(),
                    graph.edges().len()
                );
                for (i, wave) in levels.iter().enumerate() {
                    let _ = writeln!(output, "\n   Wave {i}:");
                    for address in wave {
                        let deps: Vec<String> = graph
                            .dependencies_of(address)
                            .into_iter()
                            .map(ToString::to_string)
                            .collect();
                        if deps.is_empty() {
                            let _ = writeln!(output, "     {address}");
                        } else {
                            let _ = writeln!(
                                output,
                                "     {address} {} {}",
                                "<-".dimmed(),
                                deps.join(", ")
                            );
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = if report.is_converged() {
                    format!("{} No drift detected - state matches the provider.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted {
                        let _ = writeln!(
                            output,
                            "   - {} ({}): {}",
                            resource.address, resource.id, resource.drift
                        );
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} recorded resources have drifted.\n",
                        report.drifted.len(),
                        report.observed_count
                    );
                    output
                };

                if !report.pending.is_empty() {
                    let _ = writeln!(
                        output,
                        "{} declared resources not created yet: {}",
                        report.pending.len(),
                        report.pending.join(", ")
                    );
                }
                output
            }
        }
    }

    /// Formats a reconciliation result.
    #[must_use]
    pub fn format_reconciliation(&self, result: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if result.success {
                    format!("{} Apply successful", "✓".green())
                } else {
                    format!("{} Apply failed", "✗".red())
                };

                let mut output = format!("{status}\n\n");
                let _ = writeln!(output, "   Created: {}", result.created);
                let _ = writeln!(output, "   Updated: {}", result.updated);
                let _ = writeln!(output, "   Deleted: {}", result.deleted);
                let _ = writeln!(output, "   Unchanged: {}", result.unchanged);
                if result.failed > 0 || result.skipped > 0 {
                    let _ = writeln!(output, "   Failed: {}", result.failed.to_string().red());
                    let _ = writeln!(output, "   Skipped: {}", result.skipped.to_string().yellow());
                }

                if !result.errors.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                output
            }
        }
    }

    /// Formats the observed state.
    #[must_use]
    pub fn format_state(&self, state: &ObservedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = writeln!(output, "\nState");
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.len());

                if !state.is_empty() {
                    let rows: Vec<StateRow> = state
                        .iter()
                        .map(|entry| StateRow {
                            address: entry.address.to_string(),
                            id: entry.id.clone(),
                            fingerprint: short(&entry.fingerprint).to_string(),
                            deposed: entry.deposed.len(),
                            updated: entry.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} by {} ({} resources)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.actor,
                            entry.resources.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an action kind with color.
    fn format_action(action: &PlannedAction) -> String {
        let label = match (action.kind, action.replace, action.deposed) {
            (ActionKind::Delete, _, true) => "-delete (deposed)".red(),
            (ActionKind::Create, Some(_), _) => "+create (replace)".green(),
            (ActionKind::Create, None, _) => "+create".green(),
            (ActionKind::Update, _, _) => "~update".yellow(),
            (ActionKind::Delete, Some(ReplaceStrategy::CreateBeforeDestroy), _) => {
                "-delete (after replace)".red()
            }
            (ActionKind::Delete, Some(ReplaceStrategy::DeleteBeforeCreate), _) => {
                "-delete (replace)".red()
            }
            (ActionKind::Delete, None, _) => "-delete".red(),
            (ActionKind::NoOp, _, _) => "noop".dimmed(),
        };
        label.to_string()
    }
}

/// First eight characters of a hash.
fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
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

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    declaration_hash: String,
    state_serial: u64,
    to_add: usize,
    to_change: usize,
    to_destroy: usize,
    unchanged: usize,
    actions: Vec<ActionJson>,
}

#[derive(serde::Serialize)]
struct ActionJson {
    index: usize,
    action: String,
    resource: String,
    deposed: bool,
    depends_on: Vec<usize>,
    reason: String,
    changes: Vec<String>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        let summary = plan.summary();
        Self {
            declaration_hash: plan.declaration_hash.clone(),
            state_serial: plan.state_serial,
            to_add: summary.to_add,
            to_change: summary.to_change,
            to_destroy: summary.to_destroy,
            unchanged: summary.unchanged,
            actions: plan
                .actions
                .iter()
                .enumerate()
                .filter(|(_, a)| a.kind != ActionKind::NoOp)
                .map(|(index, a)| ActionJson {
                    index,
                    action: a.kind.to_string(),
                    resource: a.address.to_string(),
                    deposed: a.deposed,
                    depends_on: a.dependencies.clone(),
                    reason: a.reason.clone(),
                    changes: a.changes.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("aws_security_group_rule.ssh", 12), "aws_secur...");
        assert_eq!(truncate("ééééé", 4), "é...");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_empty_plan_text() {
        let plan = Plan {
            created_at: chrono::Utc::now(),
            declaration_hash: String::from("0123456789"),
            state_serial: 3,
            actions: Vec::new(),
        };
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, true);
        assert!(text.contains("No changes required"));

        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state_serial"], 3);
        assert_eq!(value["actions"], serde_json::json!([]));
    }
}
