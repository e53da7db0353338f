use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ResultsError;
use crate::features::{AudioFeatures, FeatureValue};

pub const RESULTS_FILE: &str = "analysis_results.json";
pub const RESULTS_CSV_FILE: &str = "analysis_results.csv";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub url: String,
    pub views: u64,
    #[serde(flatten)]
    pub features: AudioFeatures,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SavedResults {
    pub json: PathBuf,
    pub csv: PathBuf,
}

/// Writes every record to `{dir}/analysis_results.json` and
/// `{dir}/analysis_results.csv`, creating `dir`.
pub fn save_results(dir: &Path, records: &[AnalysisRecord]) -> Result<SavedResults, ResultsError> {
    fs::create_dir_all(dir).map_err(|source| ResultsError::Io { path: dir.to_path_buf(), source })?;

    let json_path = dir.join(RESULTS_FILE);
    let json = serde_json::to_string_pretty(records)?;
    fs::write(&json_path, json).map_err(|source| ResultsError::Io { path: json_path.clone(), source })?;

    let csv_path = dir.join(RESULTS_CSV_FILE);
    write_csv(&csv_path, records)?;

    info!(json = %json_path.display(), csv = %csv_path.display(), records = records.len(), "results saved");
    Ok(SavedResults { json: json_path, csv: csv_path })
}

/// One row per record. Feature columns are the union over all records in
/// name order; vectors are written as JSON arrays and absent values as
/// empty cells.
fn write_csv(path: &Path, records: &[AnalysisRecord]) -> Result<(), ResultsError> {
    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.features.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path).map_err(|source| ResultsError::Csv { path: path.to_path_buf(), source })?;
    let csv_error = |source: csv::Error| ResultsError::Csv { path: path.to_path_buf(), source };

    let header = ["url", "views"].into_iter().chain(columns.iter().copied());
    writer.write_record(header).map_err(csv_error)?;

    for record in records {
        let mut row = vec![record.url.clone(), record.views.to_string()];
        for column in &columns {
            row.push(match record.features.get(*column) {
                Some(value) => cell(value)?,
                None => String::new(),
            });
        }
        writer.write_record(&row).map_err(csv_error)?;
    }

    writer.flush().map_err(|source| ResultsError::Io { path: path.to_path_buf(), source })
}

fn cell(value: &FeatureValue) -> Result<String, ResultsError> {
    match value {
        FeatureValue::Scalar(v) => Ok(v.to_string()),
        FeatureValue::Vector(_) => Ok(serde_json::to_string(value)?),
    }
}
