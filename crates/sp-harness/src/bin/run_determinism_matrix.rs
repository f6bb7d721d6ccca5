#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde_json::json;
use sp_harness::{CompareMode, HarnessConfig, Scenario, emit_determinism_matrix, mode_label};

const USAGE: &str = "usage: run_determinism_matrix [--mode exact|tolerance|both] [--scenario init|predict|update|pipe|all] [--output path] [--print-full-log]";

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut scenario = String::from("all");
    let mut output: Option<PathBuf> = None;
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: exact|tolerance|both".to_string())?;
                mode = value;
            }
            "--scenario" => {
                let value = args.next().ok_or_else(|| {
                    "--scenario requires one of: init|predict|update|pipe|all".to_string()
                })?;
                scenario = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let scenarios = parse_scenarios(scenario.as_str())?;
    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let output_path = output
        .unwrap_or_else(|| repo_root.join("artifacts/determinism/determinism_matrix.jsonl"));

    let summary = emit_determinism_matrix(
        &HarnessConfig::default_paths(),
        output_path.as_path(),
        modes.as_slice(),
        scenarios.as_slice(),
    )
    .map_err(|error| error.to_string())?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated determinism log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
        return summary.ensure_passed().map_err(|error| error.to_string());
    }

    let mode_labels: Vec<&str> = summary.modes.iter().map(|m| mode_label(*m)).collect();
    let scenario_labels: Vec<&str> = summary.scenarios.iter().map(|s| s.label()).collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if summary.failed_entries == 0 { "ok" } else { "failed" },
            "output_path": summary.output_path.display().to_string(),
            "log_entries": summary.log_entries,
            "failed_entries": summary.failed_entries,
            "modes": mode_labels,
            "scenarios": scenario_labels,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    summary.ensure_passed().map_err(|error| error.to_string())
}

fn parse_modes(raw: &str) -> Result<Vec<CompareMode>, String> {
    match raw {
        "exact" => Ok(vec![CompareMode::Exact]),
        "tolerance" => Ok(vec![CompareMode::tolerance()]),
        "both" => Ok(vec![CompareMode::Exact, CompareMode::tolerance()]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected exact|tolerance|both"
        )),
    }
}

fn parse_scenarios(raw: &str) -> Result<Vec<Scenario>, String> {
    if raw == "all" {
        return Ok(Scenario::ALL.to_vec());
    }
    Scenario::parse(raw).map(|scenario| vec![scenario]).ok_or_else(|| {
        format!("unsupported scenario '{raw}'; expected init|predict|update|pipe|all")
    })
}
