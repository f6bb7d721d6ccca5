use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sp_core::det64_str;

use crate::compare::CompareMode;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "seedproof.case_log.v1";

/// One JSON line per scenario case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_utc: String,
    pub suite_id: String,
    pub scenario_id: String,
    pub test_id: String,
    pub mode: String,
    pub seed: u64,
    pub env_fingerprint: String,
    pub input_digest: String,
    pub output_digest: String,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        scenario_id: &str,
        test_id: &str,
        mode: CompareMode,
        seed: u64,
        input_digest: u64,
        output_digest: u64,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION.to_string(),
            ts_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            suite_id: suite_id.to_string(),
            scenario_id: scenario_id.to_string(),
            test_id: test_id.to_string(),
            mode: mode_label(mode).to_string(),
            seed,
            env_fingerprint: env_fingerprint(),
            input_digest: digest_label(input_digest),
            output_digest: digest_label(output_digest),
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Flattened into the envelope; keys that would shadow an envelope
    /// field are dropped.
    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        for (key, value) in fields {
            if ENVELOPE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            self.extra_fields.insert(key, value);
        }
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

const ENVELOPE_FIELDS: [&str; 13] = [
    "schema_version",
    "ts_utc",
    "suite_id",
    "scenario_id",
    "test_id",
    "mode",
    "seed",
    "env_fingerprint",
    "input_digest",
    "output_digest",
    "replay_command",
    "outcome",
    "reason_code",
];

#[must_use]
pub fn mode_label(mode: CompareMode) -> &'static str {
    match mode {
        CompareMode::Exact => "exact",
        CompareMode::Tolerance { .. } => "tolerance",
    }
}

#[must_use]
pub fn digest_label(digest: u64) -> String {
    format!("det64:{digest:016x}")
}

fn env_fingerprint() -> String {
    digest_label(det64_str(&format!(
        "{}-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::{StructuredCaseLog, digest_label, mode_label};
    use crate::compare::CompareMode;

    fn sample() -> StructuredCaseLog {
        StructuredCaseLog::new(
            "model_determinism",
            "init",
            "tok2vec_seed0",
            CompareMode::Exact,
            0,
            0xabc,
            0xdef,
            "cargo test -p sp-harness -- --nocapture".to_string(),
            "pass",
            "init_params_match",
        )
    }

    #[test]
    fn digest_label_is_zero_padded() {
        assert_eq!(digest_label(0xabc), "det64:0000000000000abc");
    }

    #[test]
    fn mode_labels_are_stable() {
        assert_eq!(mode_label(CompareMode::Exact), "exact");
        assert_eq!(mode_label(CompareMode::tolerance()), "tolerance");
    }

    #[test]
    fn extra_fields_are_flattened_and_cannot_shadow_envelope() {
        let mut extra = BTreeMap::new();
        extra.insert("param_count".to_string(), json!(42));
        extra.insert("outcome".to_string(), json!("fail"));
        let log = sample().with_extra_fields(extra);

        let value = serde_json::to_value(&log).expect("log serializes");
        assert_eq!(value["param_count"], json!(42));
        assert_eq!(value["outcome"], json!("pass"));
        assert_eq!(value["input_digest"], json!("det64:0000000000000abc"));
        assert!(log.passed());
    }

    #[test]
    fn timestamp_is_rfc3339_utc() {
        let log = sample();
        assert!(log.ts_utc.ends_with('Z'), "unexpected ts: {}", log.ts_utc);
        assert!(chrono::DateTime::parse_from_rfc3339(&log.ts_utc).is_ok());
    }
}
