// ========================================================================================
//
//                         Parameter Identifiability (IDENTPAR)
//
// ========================================================================================
//
// IDENTPAR writes one row per parameter: the name, the squared components of the
// parameter's projection onto each solution-space eigenvector (`eig_1 .. eig_k`),
// and their sum as `identifiability`. A value near 1 means the calibration data
// fully constrain the parameter; near 0 means it sits in the null space.

use crate::sensitivity::{SensitivityEntry, SensitivityKind, SensitivityResult};
use crate::tokens::parse_finite;
use crate::types::{DuplicateName, Keyed, NamedTable, ParameterTable};
use ndarray::Array2;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentifiabilityError {
    #[error("failed to read IDENTPAR output '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' has no header line with an 'identifiability' column")]
    MissingHeader { path: PathBuf },
    #[error("'{path}' line {line}: {message}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("'{path}' line {line}: parameter '{name}' appears more than once")]
    DuplicateName {
        path: PathBuf,
        line: usize,
        name: String,
    },
    #[error("parameter '{0}' has no entry in the parameter table")]
    UnknownParameter(String),
}

/// One parameter's row of IDENTPAR output.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiabilityRecord {
    pub name: String,
    /// Squared eigenvector components, in `eig_1 .. eig_k` order.
    pub components: Vec<f64>,
    pub identifiability: f64,
}

impl Keyed for IdentifiabilityRecord {
    fn key(&self) -> &str {
        &self.name
    }
}

/// IDENTPAR output in file order.
#[derive(Debug, Clone, Default)]
pub struct IdentifiabilityTable {
    component_names: Vec<String>,
    records: NamedTable<IdentifiabilityRecord>,
}

const IDENTIFIABILITY_COLUMN: &str = "identifiability";

fn is_component_column(column: &str) -> bool {
    column
        .strip_prefix("eig_")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

impl IdentifiabilityTable {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdentifiabilityError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| IdentifiabilityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table = Self::from_reader(BufReader::new(file), path)?;
        log::debug!(
            "Loaded identifiability of {} parameters over {} eigenvectors from {}",
            table.len(),
            table.component_names.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parses IDENTPAR output. `origin` only labels errors.
    pub fn from_reader<R: BufRead>(reader: R, origin: &Path) -> Result<Self, IdentifiabilityError> {
        let path = || origin.to_path_buf();
        let io_error = |source| IdentifiabilityError::Io {
            path: path(),
            source,
        };
        let mut lines = reader.lines().enumerate();

        let columns: Vec<String> = loop {
            let Some((_, line)) = lines.next() else {
                return Err(IdentifiabilityError::MissingHeader { path: path() });
            };
            let columns: Vec<String> = line
                .map_err(io_error)?
                .split_whitespace()
                .map(str::to_lowercase)
                .collect();
            if columns.iter().any(|c| c == IDENTIFIABILITY_COLUMN) {
                break columns;
            }
        };
        let score_at = columns
            .iter()
            .position(|c| c == IDENTIFIABILITY_COLUMN)
            .ok_or_else(|| IdentifiabilityError::MissingHeader { path: path() })?;
        let component_at: Vec<usize> = (1..columns.len())
            .filter(|&i| is_component_column(&columns[i]))
            .collect();
        let component_names = component_at.iter().map(|&i| columns[i].clone()).collect();

        let mut records = NamedTable::new();
        for (i, line) in lines {
            let line_number = i + 1;
            let line = line.map_err(io_error)?;
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            let malformed = |message: String| IdentifiabilityError::MalformedRecord {
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
            let record = IdentifiabilityRecord {
                name: tokens[0].to_lowercase(),
                components: component_at
                    .iter()
                    .map(|&at| number(at))
                    .collect::<Result<_, _>>()?,
                identifiability: number(score_at)?,
            };
            records
                .insert(record)
                .map_err(|DuplicateName(name)| IdentifiabilityError::DuplicateName {
                    path: path(),
                    line: line_number,
                    name,
                })?;
        }

        Ok(Self {
            component_names,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentifiabilityRecord> {
        self.records.iter()
    }

    pub fn get(&self, name: &str) -> Option<&IdentifiabilityRecord> {
        self.records.get(name)
    }

    pub fn identifiability(&self, name: &str) -> Option<f64> {
        self.get(name).map(|r| r.identifiability)
    }

    /// Eigenvector column labels, e.g. `eig_1`.
    pub fn component_names(&self) -> &[String] {
        &self.component_names
    }

    /// Parameters by eigenvector, rows in file order.
    pub fn components(&self) -> Array2<f64> {
        let ncomp = self.component_names.len();
        let mut matrix = Array2::zeros((self.len(), ncomp));
        for (mut row, record) in matrix.rows_mut().into_iter().zip(self.iter()) {
            for (cell, &value) in row.iter_mut().zip(&record.components) {
                *cell = value;
            }
        }
        matrix
    }

    /// Identifiability as a ranking, so the head/tail and group views of
    /// sensitivities apply. Groups come from `parameters` when given and are
    /// left empty otherwise.
    pub fn ranking(
        &self,
        parameters: Option<&ParameterTable>,
    ) -> Result<SensitivityResult, IdentifiabilityError> {
        let entries = self
            .iter()
            .map(|record| {
                let group = match parameters {
                    Some(table) => table
                        .get(&record.name)
                        .map(|p| p.group.clone())
                        .ok_or_else(|| IdentifiabilityError::UnknownParameter(record.name.clone()))?,
                    None => String::new(),
                };
                Ok(SensitivityEntry {
                    name: record.name.clone(),
                    group,
                    score: record.identifiability,
                })
            })
            .collect::<Result<Vec<_>, IdentifiabilityError>>()?;
        Ok(SensitivityResult::new(SensitivityKind::Identifiability, entries))
    }
}
