use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::StringRecord;

use crate::{keys::SweepKey, scoring::ScoringInput};

/// Name of the column appended to every combined row.
pub const SCENARIO_COLUMN: &str = "scenario";

/// Outcome of combining relocated results.
#[derive(Debug, Default)]
pub struct CombineReport {
    /// Written file.
    pub output: PathBuf,
    /// Keys whose rows were included.
    pub combined: Vec<SweepKey>,
    /// Data rows written.
    pub rows: usize,
    /// Keys left out, with the reason.
    pub skipped: Vec<(SweepKey, String)>,
}

/// Concatenates every result whose header matches the first readable one into
/// `output`, appending a `scenario` column with the key.
pub fn combine(inputs: &[ScoringInput], output: &Path) -> Result<CombineReport> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let mut report = CombineReport {
        output: output.to_path_buf(),
        ..CombineReport::default()
    };
    let mut writer: Option<csv::Writer<std::fs::File>> = None;
    let mut header: Option<StringRecord> = None;

    for input in inputs {
        let mut table = match csv::Reader::from_path(&input.result) {
            Ok(table) => table,
            Err(err) => {
                report.skipped.push((input.key.clone(), err.to_string()));
                continue;
            }
        };
        let this_header = match table.headers() {
            Ok(h) => h.clone(),
            Err(err) => {
                report.skipped.push((input.key.clone(), err.to_string()));
                continue;
            }
        };
        match header.as_ref().map(|expected| *expected == this_header) {
            Some(false) => {
                report
                    .skipped
                    .push((input.key.clone(), "header differs from the first result".into()));
                continue;
            }
            Some(true) => {}
            None => {
                let mut out = csv::Writer::from_path(output)
                    .with_context(|| format!("failed to create {}", output.display()))?;
                let mut first = this_header.clone();
                first.push_field(SCENARIO_COLUMN);
                out.write_record(&first)?;
                writer = Some(out);
                header = Some(this_header);
            }
        }
        let Some(out) = writer.as_mut() else {
            continue;
        };

        // Rows are buffered so a file broken halfway contributes nothing.
        let mut rows = Vec::new();
        let mut broken = None;
        for record in table.records() {
            match record {
                Ok(mut record) => {
                    record.push_field(&input.key.to_string());
                    rows.push(record);
                }
                Err(err) => {
                    broken = Some(err.to_string());
                    break;
                }
            }
        }
        if let Some(reason) = broken {
            report.skipped.push((input.key.clone(), reason));
            continue;
        }
        for row in &rows {
            out.write_record(row)?;
        }
        report.rows += rows.len();
        report.combined.push(input.key.clone());
    }

    match writer {
        Some(mut out) => out.flush()?,
        None => {
            std::fs::write(output, format!("{SCENARIO_COLUMN}\n"))
                .with_context(|| format!("failed to write {}", output.display()))?;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn input(dir: &Path, key: &str, body: Option<&str>) -> ScoringInput {
        let key = SweepKey::parse(key).unwrap();
        let result = dir.join(format!("{}.csv", key.file_stem()));
        if let Some(body) = body {
            std::fs::write(&result, body).unwrap();
        }
        ScoringInput {
            key,
            result,
            artifact: None,
        }
    }

    #[test]
    fn tags_rows_and_skips_mismatched_files() {
        let dir = tempdir().unwrap();
        let inputs = vec![
            input(dir.path(), "baseline", Some("step,numAlive\n1,4\n2,5\n")),
            input(dir.path(), "fire/only", Some("step,numAlive\n1,2\n")),
            input(dir.path(), "odd", Some("step,other\n1,2\n")),
            input(dir.path(), "absent", None),
        ];
        let output = dir.path().join("combined/all.csv");
        let report = combine(&inputs, &output).unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(report.combined.len(), 2);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "step,numAlive,scenario\n1,4,baseline\n2,5,baseline\n1,2,fire/only\n"
        );
    }

    #[test]
    fn nothing_to_combine_still_writes_a_header() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("all.csv");
        let report = combine(&[input(dir.path(), "absent", None)], &output).unwrap();
        assert!(report.combined.is_empty());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "scenario\n");
    }
}
