use std::path::PathBuf;

use anyhow::bail;
use itertools::Itertools;
use serde::Deserialize;

/// Expected outcome of a fixture program: either the display form of its
/// final value or a fragment of the error it must produce.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    Ok { output: String },
    Err { error: String },
}

/// Loads the program/expectation pair for one numbered testcase from
/// `test_inputs/N.tam` and `test_outputs/N.json`.
pub fn load_test_pair(testcase: usize) -> anyhow::Result<(String, Expected)> {
    if !all_testcases().contains(&testcase) {
        bail!("Testcase out of bounds");
    }

    let base_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let source =
        std::fs::read_to_string(base_path.join("test_inputs").join(format!("{}.tam", testcase)))?;
    let raw =
        std::fs::read_to_string(base_path.join("test_outputs").join(format!("{}.json", testcase)))?;

    Ok((source, serde_json::from_str(&raw)?))
}

pub fn all_testcases() -> impl Iterator<Item = usize> {
    1..=10
}
