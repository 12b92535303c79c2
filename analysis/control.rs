// ========================================================================================
//
//                          PEST Control File (.pst) Tables
//
// ========================================================================================
//
// Only the sections the analysis needs are interpreted: parameter data, observation data
// and prior information. Every other section is skipped line by line.

use crate::tokens::{parse_finite, parse_int};
use crate::types::{
    ChangeLimit, DuplicateName, ObservationRecord, ObservationTable, ParameterRecord,
    ParameterTable, ParameterTransform,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlFileError {
    #[error("failed to read control file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' has no '* {section}' section")]
    MissingSection {
        path: PathBuf,
        section: &'static str,
    },
    #[error("'{path}' line {line}: {message}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("'{path}' line {line}: '{name}' is defined more than once")]
    DuplicateName {
        path: PathBuf,
        line: usize,
        name: String,
    },
    #[error("'{path}' line {line}: parameter '{parameter}' is tied to unknown parameter '{parent}'")]
    UnknownTiedParameter {
        path: PathBuf,
        line: usize,
        parameter: String,
        parent: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Preamble,
    ParameterData,
    ObservationData,
    PriorInformation,
    Ignored,
}

impl Section {
    fn from_header(title: &str) -> Self {
        match title {
            "parameter data" => Self::ParameterData,
            "observation data" => Self::ObservationData,
            "prior information" => Self::PriorInformation,
            _ => Self::Ignored,
        }
    }
}

/// Observation and parameter tables read from a PEST control file.
///
/// Prior-information equations become observations, keyed by their label, so
/// regularisation groups can be masked like any other group.
#[derive(Debug, Clone)]
pub struct ControlFile {
    observations: ObservationTable,
    parameters: ParameterTable,
}

impl ControlFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ControlFileError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ControlFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let control = Self::from_reader(BufReader::new(file), path)?;
        log::debug!(
            "Loaded {} parameters and {} observations from {}",
            control.parameters.len(),
            control.observations.len(),
            path.display()
        );
        Ok(control)
    }

    /// Parses control-file text. `origin` only labels errors.
    pub fn from_reader<R: BufRead>(reader: R, origin: &Path) -> Result<Self, ControlFileError> {
        let mut parser = Parser::new(origin);
        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| ControlFileError::Io {
                path: origin.to_path_buf(),
                source,
            })?;
            parser.line(i + 1, &line)?;
        }
        parser.finish()
    }

    pub fn observations(&self) -> &ObservationTable {
        &self.observations
    }

    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    pub fn into_tables(self) -> (ObservationTable, ParameterTable) {
        (self.observations, self.parameters)
    }
}

struct Tie {
    line: usize,
    parameter: String,
    parent: String,
}

struct Parser<'a> {
    origin: &'a Path,
    section: Section,
    seen_parameters: bool,
    seen_observations: bool,
    observations: ObservationTable,
    parameters: ParameterTable,
    ties: Vec<Tie>,
    /// A prior equation still collecting `&` continuation lines: (first line, tokens).
    pending_prior: Option<(usize, Vec<String>)>,
}

impl<'a> Parser<'a> {
    fn new(origin: &'a Path) -> Self {
        Self {
            origin,
            section: Section::Preamble,
            seen_parameters: false,
            seen_observations: false,
            observations: ObservationTable::new(),
            parameters: ParameterTable::new(),
            ties: Vec::new(),
            pending_prior: None,
        }
    }

    fn malformed(&self, line: usize, message: impl Into<String>) -> ControlFileError {
        ControlFileError::MalformedRecord {
            path: self.origin.to_path_buf(),
            line,
            message: message.into(),
        }
    }

    fn duplicate(&self, line: usize, DuplicateName(name): DuplicateName) -> ControlFileError {
        ControlFileError::DuplicateName {
            path: self.origin.to_path_buf(),
            line,
            name,
        }
    }

    fn number(&self, line: usize, token: &str, field: &str) -> Result<f64, ControlFileError> {
        parse_finite(token)
            .ok_or_else(|| self.malformed(line, format!("{field} '{token}' is not a finite number")))
    }

    fn weight(&self, line: usize, token: &str) -> Result<f64, ControlFileError> {
        let weight = self.number(line, token, "weight")?;
        if weight < 0.0 {
            return Err(self.malformed(line, format!("weight {weight} is negative")));
        }
        Ok(weight)
    }

    fn line(&mut self, number: usize, raw: &str) -> Result<(), ControlFileError> {
        let trimmed = raw.trim();
        // `++` lines carry PEST++ options and may follow any section.
        if trimmed.is_empty() || trimmed.starts_with("++") {
            return Ok(());
        }

        if let Some(title) = trimmed.strip_prefix('*') {
            self.flush_prior()?;
            let title = title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            self.section = Section::from_header(&title);
            match self.section {
                Section::ParameterData => self.seen_parameters = true,
                Section::ObservationData => self.seen_observations = true,
                _ => {}
            }
            return Ok(());
        }

        match self.section {
            Section::ParameterData => self.parameter_line(number, trimmed),
            Section::ObservationData => self.observation_line(number, trimmed),
            Section::PriorInformation => self.prior_line(number, trimmed),
            Section::Preamble | Section::Ignored => Ok(()),
        }
    }

    fn parameter_line(&mut self, line: usize, text: &str) -> Result<(), ControlFileError> {
        let tokens: Vec<String> = text.split_whitespace().map(str::to_lowercase).collect();
        match tokens.len() {
            10 => {
                let transform = ParameterTransform::parse(&tokens[1]).ok_or_else(|| {
                    self.malformed(line, format!("unknown parameter transform '{}'", tokens[1]))
                })?;
                let change_limit = ChangeLimit::parse(&tokens[2]).ok_or_else(|| {
                    self.malformed(line, format!("unknown change limit '{}'", tokens[2]))
                })?;
                let derivative_command = parse_int(&tokens[9]).ok_or_else(|| {
                    self.malformed(line, format!("dercom '{}' is not an integer", tokens[9]))
                })?;
                let record = ParameterRecord {
                    name: tokens[0].clone(),
                    transform,
                    change_limit,
                    value: self.number(line, &tokens[3], "parval1")?,
                    lower_bound: self.number(line, &tokens[4], "parlbnd")?,
                    upper_bound: self.number(line, &tokens[5], "parubnd")?,
                    group: tokens[6].clone(),
                    scale: self.number(line, &tokens[7], "scale")?,
                    offset: self.number(line, &tokens[8], "offset")?,
                    derivative_command,
                    tied_to: None,
                };
                self.parameters
                    .insert(record)
                    .map_err(|dup| self.duplicate(line, dup))
            }
            2 => {
                self.ties.push(Tie {
                    line,
                    parameter: tokens[0].clone(),
                    parent: tokens[1].clone(),
                });
                Ok(())
            }
            n => Err(self.malformed(
                line,
                format!("parameter data rows have 10 fields (or 2 for a tie), found {n}"),
            )),
        }
    }

    fn observation_line(&mut self, line: usize, text: &str) -> Result<(), ControlFileError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() != 4 {
            return Err(self.malformed(
                line,
                format!("observation data rows have 4 fields, found {}", tokens.len()),
            ));
        }
        let record = ObservationRecord {
            name: tokens[0].to_lowercase(),
            value: self.number(line, tokens[1], "obsval")?,
            weight: self.weight(line, tokens[2])?,
            group: tokens[3].to_lowercase(),
        };
        self.observations
            .insert(record)
            .map_err(|dup| self.duplicate(line, dup))
    }

    fn prior_line(&mut self, line: usize, text: &str) -> Result<(), ControlFileError> {
        if let Some(rest) = text.strip_prefix('&') {
            if self.pending_prior.is_none() {
                return Err(self.malformed(line, "continuation line without a prior equation"));
            }
            if let Some((_, tokens)) = &mut self.pending_prior {
                tokens.extend(rest.split_whitespace().map(str::to_lowercase));
            }
            return Ok(());
        }
        self.flush_prior()?;
        self.pending_prior = Some((line, text.split_whitespace().map(str::to_lowercase).collect()));
        Ok(())
    }

    /// Completes the pending prior equation: `label ... = value weight group`.
    fn flush_prior(&mut self) -> Result<(), ControlFileError> {
        let Some((line, tokens)) = self.pending_prior.take() else {
            return Ok(());
        };
        let n = tokens.len();
        if n < 5 || !tokens[..n - 3].iter().any(|t| t.contains('=')) {
            return Err(self.malformed(
                line,
                "prior information needs 'label ... = value weight group'",
            ));
        }
        let record = ObservationRecord {
            name: tokens[0].clone(),
            value: self.number(line, &tokens[n - 3], "pival")?,
            weight: self.weight(line, &tokens[n - 2])?,
            group: tokens[n - 1].clone(),
        };
        self.observations
            .insert(record)
            .map_err(|dup| self.duplicate(line, dup))
    }

    fn finish(mut self) -> Result<ControlFile, ControlFileError> {
        self.flush_prior()?;
        for (seen, section) in [
            (self.seen_parameters, "parameter data"),
            (self.seen_observations, "observation data"),
        ] {
            if !seen {
                return Err(ControlFileError::MissingSection {
                    path: self.origin.to_path_buf(),
                    section,
                });
            }
        }

        for tie in std::mem::take(&mut self.ties) {
            let unknown = |tie: Tie| ControlFileError::UnknownTiedParameter {
                path: self.origin.to_path_buf(),
                line: tie.line,
                parameter: tie.parameter,
                parent: tie.parent,
            };
            if !self.parameters.contains(&tie.parent) {
                return Err(unknown(tie));
            }
            match self.parameters.get_mut(&tie.parameter) {
                Some(child) => {
                    if child.transform != ParameterTransform::Tied {
                        log::warn!(
                            "{} line {}: '{}' is tied to '{}' but its transform is '{}'",
                            self.origin.display(),
                            tie.line,
                            tie.parameter,
                            tie.parent,
                            child.transform
                        );
                    }
                    child.tied_to = Some(tie.parent);
                }
                None => return Err(unknown(tie)),
            }
        }

        Ok(ControlFile {
            observations: self.observations,
            parameters: self.parameters,
        })
    }
}
