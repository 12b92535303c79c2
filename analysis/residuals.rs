// ========================================================================================
//
//                           Residual Tables (.res / .rei)
//
// ========================================================================================

use crate::tokens::parse_finite;
use crate::types::{DuplicateName, Keyed, NamedTable};
use itertools::Itertools;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResidualError {
    #[error("failed to read residual file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' has no header line naming both 'Name' and 'Residual'")]
    MissingHeader { path: PathBuf },
    #[error("'{path}' line {line}: the header has no '{column}' column")]
    MissingColumn {
        path: PathBuf,
        line: usize,
        column: &'static str,
    },
    #[error("'{path}' line {line}: {message}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("'{path}' line {line}: observation '{name}' appears more than once")]
    DuplicateName {
        path: PathBuf,
        line: usize,
        name: String,
    },
}

/// One observation's row in a residual file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualRecord {
    pub name: String,
    pub group: String,
    pub measured: f64,
    pub modelled: f64,
    pub residual: f64,
    pub weight: f64,
}

impl ResidualRecord {
    pub fn weighted_residual(&self) -> f64 {
        self.residual * self.weight
    }

    pub fn absolute_residual(&self) -> f64 {
        self.residual.abs()
    }

    pub fn weighted_absolute_residual(&self) -> f64 {
        self.absolute_residual() * self.weight
    }
}

impl Keyed for ResidualRecord {
    fn key(&self) -> &str {
        &self.name
    }
}

/// Count, mean, sample standard deviation and extent of a set of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    /// `n - 1` denominator; NaN for a single value.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

impl SummaryStats {
    fn from_values(values: &[f64]) -> Self {
        let count = values.len();
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std_dev = if count > 1 {
            let squares = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
            (squares / (n - 1.0)).sqrt()
        } else {
            f64::NAN
        };
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Self {
            count,
            mean,
            std_dev,
            min,
            max,
            range: max - min,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub group: String,
    pub residual: SummaryStats,
    pub absolute_residual: SummaryStats,
    pub weighted_residual: SummaryStats,
}

/// A group's share of the objective function.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveContribution {
    pub group: String,
    pub phi: f64,
    /// Percentage of the total; zero when the total itself is zero.
    pub percent: f64,
}

/// The residual table PEST writes after a run, in file order.
#[derive(Debug, Clone, Default)]
pub struct ResidualTable {
    records: NamedTable<ResidualRecord>,
}

/// Header columns a residual file must carry.
const REQUIRED_COLUMNS: [&str; 6] = ["name", "group", "measured", "modelled", "residual", "weight"];

impl ResidualTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ResidualError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ResidualError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_reader(BufReader::new(file), path)?;
        log::debug!(
            "Loaded {} residuals in {} groups from {}",
            table.len(),
            table.groups().len(),
            path.display()
        );
        Ok(table)
    }

    /// Parses residual text. `origin` only labels errors.
    pub fn from_reader<R: BufRead>(reader: R, origin: &Path) -> Result<Self, ResidualError> {
        let path = || origin.to_path_buf();
        let mut lines = reader.lines().enumerate();

        // PEST precedes the table with free text in .rei files.
        let (header_line, columns) = loop {
            let Some((i, line)) = lines.next() else {
                return Err(ResidualError::MissingHeader { path: path() });
            };
            let line = line.map_err(|source| ResidualError::Io {
                path: path(),
                source,
            })?;
            if line.contains("Name") && line.contains("Residual") {
                let columns: Vec<String> =
                    line.split_whitespace().map(|c| c.to_lowercase()).collect();
                break (i + 1, columns);
            }
        };

        let mut positions = [0usize; REQUIRED_COLUMNS.len()];
        for (slot, column) in positions.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = columns
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| ResidualError::MissingColumn {
                    path: path(),
                    line: header_line,
                    column,
                })?;
        }
        let [name_at, group_at, measured_at, modelled_at, residual_at, weight_at] = positions;

        let mut records = NamedTable::new();
        for (i, line) in lines {
            let line_number = i + 1;
            let line = line.map_err(|source| ResidualError::Io {
                path: path(),
                source,
            })?;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            let malformed = |message: String| ResidualError::MalformedRecord {
                path: path(),
                line: line_number,
                message,
            };
            if tokens.len() != columns.len() {
                return Err(malformed(format!(
                    "expected {} fields, found {}",
                    columns.len(),
                    tokens.len()
                )));
            }
            let number = |at: usize| {
                parse_finite(tokens[at]).ok_or_else(|| {
                    malformed(format!(
                        "'{}' is not a finite number in column '{}'",
                        tokens[at], columns[at]
                    ))
                })
            };
            let record = ResidualRecord {
                name: tokens[name_at].to_lowercase(),
                group: tokens[group_at].to_lowercase(),
                measured: number(measured_at)?,
                modelled: number(modelled_at)?,
                residual: number(residual_at)?,
                weight: number(weight_at)?,
            };
            records
                .insert(record)
                .map_err(|DuplicateName(name)| ResidualError::DuplicateName {
                    path: path(),
                    line: line_number,
                    name,
                })?;
        }

        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResidualRecord> {
        self.records.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ResidualRecord> {
        self.records.get(name)
    }

    pub fn weighted_residual(&self, name: &str) -> Option<f64> {
        self.get(name).map(ResidualRecord::weighted_residual)
    }

    /// Objective function: the sum of squared weighted residuals.
    pub fn phi(&self) -> f64 {
        self.iter()
            .map(|r| r.weighted_residual() * r.weighted_residual())
            .sum()
    }

    /// Distinct groups in natural order.
    pub fn groups(&self) -> Vec<&str> {
        self.iter()
            .map(|r| r.group.as_str())
            .unique()
            .sorted_by(|a, b| natord::compare(a, b))
            .collect()
    }

    pub fn group(&self, group: &str) -> Vec<&ResidualRecord> {
        let group = group.to_lowercase();
        self.iter().filter(|r| r.group == group).collect()
    }

    /// Statistics for one group, or `None` when it has no records.
    pub fn stats(&self, group: &str) -> Option<GroupStats> {
        let records = self.group(group);
        if records.is_empty() {
            return None;
        }
        let column = |f: fn(&ResidualRecord) -> f64| -> Vec<f64> {
            records.iter().map(|r| f(r)).collect()
        };
        Some(GroupStats {
            group: records[0].group.clone(),
            residual: SummaryStats::from_values(&column(|r| r.residual)),
            absolute_residual: SummaryStats::from_values(&column(ResidualRecord::absolute_residual)),
            weighted_residual: SummaryStats::from_values(&column(ResidualRecord::weighted_residual)),
        })
    }

    pub fn stats_all(&self) -> Vec<GroupStats> {
        self.groups()
            .into_iter()
            .filter_map(|group| self.stats(group))
            .collect()
    }

    /// Each group's part of `phi`, largest first.
    pub fn objective_contributions(&self) -> Vec<ObjectiveContribution> {
        let total = self.phi();
        self.groups()
            .into_iter()
            .map(|group| {
                let phi: f64 = self
                    .iter()
                    .filter(|r| r.group == group)
                    .map(|r| r.weighted_residual() * r.weighted_residual())
                    .sum();
                let percent = if total > 0.0 { 100.0 * phi / total } else { 0.0 };
                ObjectiveContribution {
                    group: group.to_string(),
                    phi,
                    percent,
                }
            })
            .sorted_by(|a, b| {
                b.phi
                    .total_cmp(&a.phi)
                    .then_with(|| natord::compare(&a.group, &b.group))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    const RES: &str = "\
 Name                 Group              Measured         Modelled         Residual         Weight  Weight*Measured
 h1                   HEAD               10.0             9.0              1.0              1.0     10.0
 h2                   head               12.0             15.0            -3.0              1.0     12.0
 h3                   head               11.0             11.5            -0.5              2.0     22.0
 f1                   flux               100.0            98.0             2.0              0.5     50.0
";

    fn parse(text: &str) -> Result<ResidualTable, ResidualError> {
        ResidualTable::from_reader(Cursor::new(text), Path::new("case.res"))
    }

    #[test]
    fn loads_rows_and_derives_weighted_residuals() {
        let table = parse(RES).unwrap();
        assert_eq!(table.len(), 4);
        let h3 = table.get("h3").unwrap();
        assert_eq!(h3.group, "head");
        assert_abs_diff_eq!(h3.weighted_residual(), -1.0);
        assert_abs_diff_eq!(h3.absolute_residual(), 0.5);
        assert_abs_diff_eq!(h3.weighted_absolute_residual(), 1.0);
        assert_eq!(table.weighted_residual("f1"), Some(1.0));
        // 1 + 9 + 1 + 1
        assert_abs_diff_eq!(table.phi(), 12.0);
    }

    #[test]
    fn skips_preamble_until_header() {
        let rei = format!(
            "\n MODEL OUTPUTS AT END OF OPTIMISATION ITERATION NO.    3:-\n\n{RES}"
        );
        let table = parse(&rei).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.groups(), vec!["flux", "head"]);
    }

    #[test]
    fn group_statistics_match_hand_computation() {
        let table = parse(RES).unwrap();
        let head = table.stats("HEAD").unwrap();
        assert_eq!(head.residual.count, 3);
        // residuals 1, -3, -0.5
        assert_abs_diff_eq!(head.residual.mean, -2.5 / 3.0, epsilon = 1e-12);
        let mean = -2.5 / 3.0;
        let var = ((1.0 - mean) * (1.0 - mean)
            + (-3.0 - mean) * (-3.0 - mean)
            + (-0.5 - mean) * (-0.5 - mean))
            / 2.0;
        assert_abs_diff_eq!(head.residual.std_dev, f64::sqrt(var), epsilon = 1e-12);
        assert_abs_diff_eq!(head.residual.min, -3.0);
        assert_abs_diff_eq!(head.residual.max, 1.0);
        assert_abs_diff_eq!(head.residual.range, 4.0);
        assert_abs_diff_eq!(head.absolute_residual.mean, 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(head.weighted_residual.min, -3.0);

        let flux = table.stats("flux").unwrap();
        assert!(flux.residual.std_dev.is_nan());
        assert!(table.stats("conc").is_none());
        assert_eq!(table.stats_all().len(), 2);
    }

    #[test]
    fn objective_contributions_sum_to_total() {
        let table = parse(RES).unwrap();
        let contributions = table.objective_contributions();
        assert_eq!(contributions[0].group, "head");
        assert_abs_diff_eq!(contributions[0].phi, 11.0);
        assert_abs_diff_eq!(contributions[0].percent, 100.0 * 11.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(contributions[1].phi, 1.0);
        let total: f64 = contributions.iter().map(|c| c.percent).sum();
        assert_abs_diff_eq!(total, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn rejects_malformed_rows_with_line_numbers() {
        let short = " Name Group Measured Modelled Residual Weight\n o1 g 1.0 1.0 0.0\n";
        match parse(short) {
            Err(ResidualError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected MalformedRecord, got {other:?}"),
        }

        let text = " Name Group Measured Modelled Residual Weight\n\n o1 g 1.0 x 0.0 1.0\n";
        match parse(text) {
            Err(ResidualError::MalformedRecord { line, message, .. }) => {
                assert_eq!(line, 3);
                assert!(message.contains("modelled"));
            }
            other => panic!("expected MalformedRecord, got {other:?}"),
        }

        let duplicated = " Name Group Measured Modelled Residual Weight\n a g 1 1 0 1\n A g 1 1 0 1\n";
        assert!(matches!(
            parse(duplicated),
            Err(ResidualError::DuplicateName { line: 3, .. })
        ));
    }

    #[test]
    fn missing_header_or_column_is_reported() {
        assert!(matches!(
            parse("no table here\n"),
            Err(ResidualError::MissingHeader { .. })
        ));
        assert!(matches!(
            parse(" Name Group Measured Residual Weight\n"),
            Err(ResidualError::MissingColumn {
                column: "modelled",
                line: 1,
                ..
            })
        ));
    }

    #[test]
    fn load_reads_from_disk_and_reports_missing_files() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(RES.as_bytes()).unwrap();
        let table = ResidualTable::load(file.path()).unwrap();
        assert_eq!(table.group("head").len(), 3);

        let missing = ResidualTable::load("/nonexistent/case.res");
        assert!(matches!(missing, Err(ResidualError::Io { .. })));
    }
}
