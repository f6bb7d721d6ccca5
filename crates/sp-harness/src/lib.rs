#![forbid(unsafe_code)]

pub mod builder;
pub mod compare;
pub mod gradient;
mod logging;
pub mod scenario;
pub mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sp_core::ArrayError;
use sp_models::ConfigError;
use sp_nn::NnError;
use sp_pipeline::PipelineError;
use sp_random::RandomError;

pub use builder::{ModelConfig, ModelKind, build, build_from_json, build_initialized};
pub use compare::{CompareMode, Comparison, Mismatch, compare_arrays, compare_outputs, compare_values};
pub use gradient::{synthesize_for_value, synthesize_gradient};
pub use logging::{StructuredCaseLog, digest_label, mode_label};
pub use scenario::{
    InitializationReport, PipeReport, PredictionReport, Scenario, UpdateReport, get_docs,
    run_initialization_case, run_pipe_case, run_prediction_case, run_update_case,
    trained_snapshot,
};
pub use snapshot::{SnapshotEntry, snapshot, snapshot_entries};

pub const MODEL_CASES_FIXTURE: &str = "model_cases.json";
pub const PIPE_CASES_FIXTURE: &str = "pipe_cases.json";
pub const DEFAULT_UPDATE_ITERATIONS: usize = 5;
pub const DEFAULT_LEARN_RATE: f64 = 0.001;

const MAX_FIXTURE_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    Config(ConfigError),
    ConfigParse {
        kind: &'static str,
        message: String,
    },
    Model(NnError),
    Pipeline(PipelineError),
    UnsupportedOutput {
        context: &'static str,
        kind: &'static str,
    },
    /// `source` is a fixture path or a case id.
    Fixture {
        source: String,
        message: String,
    },
    Io {
        path: PathBuf,
        message: String,
    },
    CasesFailed {
        failed: usize,
        total: usize,
    },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "invalid model config: {error}"),
            Self::ConfigParse { kind, message } => {
                write!(f, "failed parsing {kind} config: {message}")
            }
            Self::Model(error) => write!(f, "model error: {error}"),
            Self::Pipeline(error) => write!(f, "pipeline error: {error}"),
            Self::UnsupportedOutput { context, kind } => {
                write!(f, "{context}: unsupported model output kind '{kind}'")
            }
            Self::Fixture { source, message } => write!(f, "fixture {source}: {message}"),
            Self::Io { path, message } => write!(f, "io error at {}: {message}", path.display()),
            Self::CasesFailed { failed, total } => {
                write!(f, "{failed} of {total} determinism cases failed")
            }
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<ConfigError> for HarnessError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl From<NnError> for HarnessError {
    fn from(error: NnError) -> Self {
        Self::Model(error)
    }
}

impl From<PipelineError> for HarnessError {
    fn from(error: PipelineError) -> Self {
        Self::Pipeline(error)
    }
}

impl From<RandomError> for HarnessError {
    fn from(error: RandomError) -> Self {
        Self::Model(NnError::from(error))
    }
}

impl From<ArrayError> for HarnessError {
    fn from(error: ArrayError) -> Self {
        Self::Model(NnError::from(error))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub default_mode: CompareMode,
    pub update_iterations: usize,
    pub learn_rate: f64,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            default_mode: CompareMode::Exact,
            update_iterations: DEFAULT_UPDATE_ITERATIONS,
            learn_rate: DEFAULT_LEARN_RATE,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCaseFile {
    pub schema_version: String,
    pub cases: Vec<ModelCase>,
}

/// One seeded model configuration, used by the init, predict and update
/// scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelCase {
    pub id: String,
    pub seed: u64,
    /// Dropout rate applied to the whole tree before training.
    pub dropout: f64,
    pub config: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeCaseFile {
    pub schema_version: String,
    pub cases: Vec<PipeCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipeCase {
    pub id: String,
    pub seed: u64,
    pub component: String,
    pub repeats: usize,
    pub drop: f64,
    pub pipe_cfg: serde_json::Value,
    pub text: String,
    pub cats: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub scenario: Scenario,
    pub fixture: &'static str,
    pub exact_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeterminismSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub modes: Vec<CompareMode>,
    pub scenarios: Vec<Scenario>,
}

impl DeterminismSummary {
    /// Turns any failed log entry into an error, for the process exit status.
    pub fn ensure_passed(&self) -> Result<(), HarnessError> {
        if self.failed_entries == 0 {
            Ok(())
        } else {
            Err(HarnessError::CasesFailed {
                failed: self.failed_entries,
                total: self.log_entries,
            })
        }
    }
}

pub fn load_model_cases(config: &HarnessConfig) -> Result<ModelCaseFile, HarnessError> {
    load_fixture(&config.fixture_root.join(MODEL_CASES_FIXTURE))
}

pub fn load_pipe_cases(config: &HarnessConfig) -> Result<PipeCaseFile, HarnessError> {
    load_fixture(&config.fixture_root.join(PIPE_CASES_FIXTURE))
}

pub fn run_initialization_suite(
    config: &HarnessConfig,
    mode: CompareMode,
) -> Result<(HarnessReport, Vec<InitializationReport>), HarnessError> {
    let fixture = load_model_cases(config)?;
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_initialization_case(case, mode)?);
    }
    let report = model_report(
        Scenario::Initialization,
        mode,
        cases.iter().map(InitializationReport::passed),
    );
    Ok((report, cases))
}

pub fn run_prediction_suite(
    config: &HarnessConfig,
    mode: CompareMode,
) -> Result<(HarnessReport, Vec<PredictionReport>), HarnessError> {
    let fixture = load_model_cases(config)?;
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_prediction_case(case, mode)?);
    }
    let report = model_report(
        Scenario::Prediction,
        mode,
        cases.iter().map(PredictionReport::passed),
    );
    Ok((report, cases))
}

pub fn run_update_suite(
    config: &HarnessConfig,
    mode: CompareMode,
) -> Result<(HarnessReport, Vec<UpdateReport>), HarnessError> {
    let fixture = load_model_cases(config)?;
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_update_case(case, config, mode)?);
    }
    let report = model_report(Scenario::Update, mode, cases.iter().map(UpdateReport::passed));
    Ok((report, cases))
}

pub fn run_pipe_suite(
    config: &HarnessConfig,
    mode: CompareMode,
) -> Result<(HarnessReport, Vec<PipeReport>), HarnessError> {
    let fixture = load_pipe_cases(config)?;
    let mut cases = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        cases.push(run_pipe_case(case, mode)?);
    }
    let (cases_total, cases_passed) = summarize_passes(cases.iter().map(PipeReport::passed));
    let report = HarnessReport {
        suite: scenario::PIPE_SUITE_ID,
        scenario: Scenario::Pipe,
        fixture: PIPE_CASES_FIXTURE,
        exact_mode: mode == CompareMode::Exact,
        cases_total,
        cases_passed,
    };
    Ok((report, cases))
}

/// Run the selected scenarios in every mode and write one structured log
/// line per case to `output_path`. Empty `modes` means exact and tolerance;
/// empty `scenarios` means all of them.
pub fn emit_determinism_matrix(
    config: &HarnessConfig,
    output_path: &Path,
    modes: &[CompareMode],
    scenarios: &[Scenario],
) -> Result<DeterminismSummary, HarnessError> {
    let selected_modes = if modes.is_empty() {
        vec![CompareMode::Exact, CompareMode::tolerance()]
    } else {
        modes.to_vec()
    };
    let selected_scenarios = if scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        scenarios.to_vec()
    };
    let needs_models = selected_scenarios
        .iter()
        .any(|scenario| *scenario != Scenario::Pipe);
    let model_fixture = if needs_models {
        Some(load_model_cases(config)?)
    } else {
        None
    };
    let pipe_fixture = if selected_scenarios.contains(&Scenario::Pipe) {
        Some(load_pipe_cases(config)?)
    } else {
        None
    };

    let mut logs = Vec::new();
    for mode in selected_modes.iter().copied() {
        for scenario in selected_scenarios.iter().copied() {
            match (scenario, model_fixture.as_ref(), pipe_fixture.as_ref()) {
                (Scenario::Initialization, Some(fixture), _) => {
                    for case in &fixture.cases {
                        logs.push(run_initialization_case(case, mode)?.forensic_log);
                    }
                }
                (Scenario::Prediction, Some(fixture), _) => {
                    for case in &fixture.cases {
                        logs.push(run_prediction_case(case, mode)?.forensic_log);
                    }
                }
                (Scenario::Update, Some(fixture), _) => {
                    for case in &fixture.cases {
                        logs.push(run_update_case(case, config, mode)?.forensic_log);
                    }
                }
                (Scenario::Pipe, _, Some(fixture)) => {
                    for case in &fixture.cases {
                        logs.push(run_pipe_case(case, mode)?.forensic_log);
                    }
                }
                _ => {}
            }
        }
    }

    let mut lines = String::new();
    for entry in &logs {
        let line = serde_json::to_string(entry).map_err(|error| HarnessError::Io {
            path: output_path.to_path_buf(),
            message: format!("failed to serialize structured log entry: {error}"),
        })?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| HarnessError::Io {
            path: parent.to_path_buf(),
            message: format!("failed to create output dir: {error}"),
        })?;
    }
    fs::write(output_path, lines).map_err(|error| HarnessError::Io {
        path: output_path.to_path_buf(),
        message: format!("failed to write determinism log: {error}"),
    })?;

    let failed_entries = logs.iter().filter(|entry| entry.outcome != "pass").count();
    Ok(DeterminismSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        failed_entries,
        modes: selected_modes,
        scenarios: selected_scenarios,
    })
}

fn model_report<I>(scenario: Scenario, mode: CompareMode, passes: I) -> HarnessReport
where
    I: Iterator<Item = bool>,
{
    let (cases_total, cases_passed) = summarize_passes(passes);
    HarnessReport {
        suite: scenario::MODEL_SUITE_ID,
        scenario,
        fixture: MODEL_CASES_FIXTURE,
        exact_mode: mode == CompareMode::Exact,
        cases_total,
        cases_passed,
    }
}

fn load_fixture<T>(path: &Path) -> Result<T, HarnessError>
where
    T: for<'de> Deserialize<'de>,
{
    let fixture_error = |message: String| HarnessError::Fixture {
        source: path.display().to_string(),
        message,
    };
    let metadata = fs::metadata(path)
        .map_err(|error| fixture_error(format!("failed reading fixture metadata: {error}")))?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(fixture_error(format!(
            "exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}"
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| fixture_error(format!("failed reading fixture: {error}")))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| fixture_error(format!("failed parsing fixture: {error}")))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for ok in iter {
        total += 1;
        if ok {
            passed += 1;
        }
    }
    (total, passed)
}
