//! Format run reports for human consumption.

use crate::engine::RunReport;
use crate::worker::UnitExit;

/// Format a run report for human consumption.
pub fn format_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");
    output.push_str("  Wyvern Run Report\n");
    output.push_str("═══════════════════════════════════════════════════════════════════════\n\n");

    // Summary
    output.push_str(&format!("Run status:             {:?}\n", report.status));
    output.push_str(&format!("Wall time:              {:.2?}\n", report.wall_time));
    output.push_str(&format!(
        "Execution units:        {}\n",
        report.unit_exits.len()
    ));
    output.push('\n');

    // Unit exits
    let tally = |wanted: UnitExit| {
        report
            .unit_exits
            .iter()
            .filter(|exit| **exit == wanted)
            .count()
    };
    output.push_str("─── Unit Exits ────────────────────────────────────────────────────────\n");
    output.push_str(&format!(
        "Exhausted:              {}\n",
        tally(UnitExit::Exhausted)
    ));
    output.push_str(&format!(
        "Cancelled:              {}\n",
        tally(UnitExit::Cancelled)
    ));
    let retired: Vec<String> = report
        .unit_exits
        .iter()
        .enumerate()
        .filter(|(_, exit)| **exit == UnitExit::Retired)
        .map(|(unit, _)| unit.to_string())
        .collect();
    if retired.is_empty() {
        output.push_str("Retired:                0\n");
    } else {
        output.push_str(&format!(
            "Retired:                {} (units {})\n",
            retired.len(),
            retired.join(", ")
        ));
    }
    output.push('\n');

    // Registry lists at the end of the run
    let counts = &report.counts;
    output.push_str("─── State Lists ───────────────────────────────────────────────────────\n");
    output.push_str(&format!("Ready:                  {}\n", counts.ready));
    output.push_str(&format!("Busy:                   {}\n", counts.busy));
    output.push_str(&format!("Terminated:             {}\n", counts.terminated));
    output.push_str(&format!("Killed:                 {}\n", counts.killed));
    output.push('\n');

    output.push_str("═══════════════════════════════════════════════════════════════════════\n");

    output
}

/// The same report as pretty-printed JSON, for scripted consumers.
pub fn json_report(report: &RunReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunStatus;
    use crate::registry::ListCounts;
    use std::time::Duration;

    fn make_report(status: RunStatus, unit_exits: Vec<UnitExit>) -> RunReport {
        RunReport {
            status,
            unit_exits,
            counts: ListCounts {
                ready: 0,
                busy: 0,
                terminated: 8,
                killed: 1,
            },
            wall_time: Duration::from_millis(1500),
        }
    }

    #[test]
    fn format_report_summarizes_a_clean_run() {
        let report = make_report(
            RunStatus::Exhausted,
            vec![UnitExit::Exhausted, UnitExit::Exhausted, UnitExit::Exhausted],
        );

        let formatted = format_report(&report);
        assert!(formatted.contains("Wyvern Run Report"));
        assert!(formatted.contains("Run status:             Exhausted"));
        assert!(formatted.contains("Execution units:        3"));
        assert!(formatted.contains("Exhausted:              3"));
        assert!(formatted.contains("Retired:                0"));
        assert!(formatted.contains("Terminated:             8"));
    }

    #[test]
    fn format_report_names_retired_units() {
        let report = make_report(
            RunStatus::Degraded,
            vec![
                UnitExit::Exhausted,
                UnitExit::Retired,
                UnitExit::Exhausted,
                UnitExit::Retired,
            ],
        );

        let formatted = format_report(&report);
        assert!(formatted.contains("Run status:             Degraded"));
        assert!(formatted.contains("Retired:                2 (units 1, 3)"));
    }

    #[test]
    fn json_report_round_trips_through_serde() {
        let report = make_report(RunStatus::Cancelled, vec![UnitExit::Cancelled]);

        let json = json_report(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "Cancelled");
        assert_eq!(value["counts"]["terminated"], 8);
        assert_eq!(value["unit_exits"][0], "Cancelled");
    }
}
