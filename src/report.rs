//! Health report rendering for the `preflight` binary

use crate::collectors::CollectedData;
use crate::orchestration::StateManager;
use crate::status::{State, StatusReport};
use serde::Serialize;

/// Every status is successful
pub const EXIT_OK: i32 = 0;
/// At least one initializer (or the run itself) reported an error
pub const EXIT_FAILED: i32 = 1;
/// The bootstrap file could not be loaded
pub const EXIT_CONFIG: i32 = 2;

/// Status of one initializer with its name and resource type
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub report: StatusReport,
}

impl ComponentReport {
    fn is_healthy(&self) -> bool {
        !self.report.has_errors && !matches!(self.report.status, State::Error | State::Failed)
    }
}

/// Timing summary for one measured `(component, operation)` pair, in seconds
#[derive(Debug, Clone, Serialize)]
pub struct MetricEntry {
    pub component: String,
    pub operation: String,
    pub count: u64,
    pub total: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

/// Everything the binary prints after a run
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub manager: StatusReport,
    pub execution_order: Vec<String>,
    pub initializers: Vec<ComponentReport>,
    pub metrics: Vec<MetricEntry>,
    pub collected: CollectedData,
}

impl HealthReport {
    pub fn from_manager(manager: &StateManager) -> Self {
        let initializers: Vec<ComponentReport> = manager
            .statuses()
            .into_iter()
            .map(|(name, status)| ComponentReport {
                name: name.to_string(),
                kind: manager
                    .get(name)
                    .map_or("unknown", |initializer| initializer.kind())
                    .to_string(),
                report: status.to_report(),
            })
            .collect();

        let metrics = manager
            .monitor()
            .all_metrics()
            .into_iter()
            .map(|((component, operation), record)| MetricEntry {
                component,
                operation,
                count: record.count,
                total: record.total_duration.as_secs_f64(),
                average: record.average().as_secs_f64(),
                min: record.min_duration.as_secs_f64(),
                max: record.max_duration.as_secs_f64(),
            })
            .collect();

        let manager_report = manager.status().to_report();
        let healthy = !manager_report.has_errors
            && manager_report.status != State::Failed
            && initializers.iter().all(ComponentReport::is_healthy);

        Self {
            healthy,
            manager: manager_report,
            execution_order: manager.execution_order().to_vec(),
            initializers,
            metrics,
            collected: manager.collector().snapshot(),
        }
    }

    /// `EXIT_OK` when healthy, otherwise `EXIT_FAILED`
    pub fn exit_code(&self) -> i32 {
        if self.healthy {
            EXIT_OK
        } else {
            EXIT_FAILED
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// One row per initializer with its state, duration and first error
    pub fn render_table(&self) -> String {
        let headers = ["NAME", "TYPE", "STATUS", "DURATION", "ERROR"];
        let rows: Vec<[String; 5]> = self
            .initializers
            .iter()
            .map(|component| {
                [
                    component.name.clone(),
                    component.kind.clone(),
                    component.report.status.to_string(),
                    component
                        .report
                        .duration
                        .map_or_else(|| "-".to_string(), |secs| format!("{:.3}s", secs)),
                    component.report.first_error().unwrap_or("-").to_string(),
                ]
            })
            .collect();

        let mut widths = headers.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let format_row = |cells: &[String]| {
            cells
                .iter()
                .zip(widths.iter())
                .map(|(cell, width)| format!("{:<width$}", cell, width = width))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };

        let mut lines = Vec::with_capacity(rows.len() + 2);
        lines.push(format_row(headers.map(String::from).as_slice()));
        for row in &rows {
            lines.push(format_row(row.as_slice()));
        }
        lines.push(format!(
            "overall: {}",
            if self.healthy { "healthy" } else { "unhealthy" }
        ));
        if let Some(error) = self.manager.first_error() {
            lines.push(format!("error: {}", error));
        }
        lines.join("\n")
    }
}
