// ========================================================================================
//
//                          The Binary Jacobian (.jco) Codec
//
// ========================================================================================
//
// PEST stores the Jacobian as a sparse list of `(linear index, value)` triplets followed
// by two fixed-width name tables. The layout, little-endian throughout:
//
//   [i32 npar][i32 nobs][i32 count]          header; the sign of each is a legacy flag
//   count x [i32 linear index][f64 value]    1-based, column-major over an nobs x npar grid
//   npar  x [12 bytes, space padded]         parameter names, column order
//   nobs  x [20 bytes, space padded]         observation names, row order
//
// Decoding is a single forward pass. Any failure discards the records read so far.

use crate::progress::{DecodeProgressObserver, NoopDecodeProgress};
use ahash::AHashMap;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Width of a parameter name in the name table.
pub const PARAMETER_NAME_WIDTH: usize = 12;
/// Width of an observation name in the name table.
pub const OBSERVATION_NAME_WIDTH: usize = 20;
/// Progress is reported every this many records, and only for files with more records than this.
pub const PROGRESS_RECORD_INTERVAL: u64 = 1_000_000;

const HEADER_BYTES: u64 = 12;
const RECORD_BYTES: usize = 12;

/// Which part of the file was being read when something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JcoSection {
    Header,
    Records,
    ParameterNames,
    ObservationNames,
}

impl fmt::Display for JcoSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "header",
            Self::Records => "derivative records",
            Self::ParameterNames => "parameter names",
            Self::ObservationNames => "observation names",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameKind {
    Parameter,
    Observation,
}

impl NameKind {
    pub fn width(self) -> usize {
        match self {
            Self::Parameter => PARAMETER_NAME_WIDTH,
            Self::Observation => OBSERVATION_NAME_WIDTH,
        }
    }

    fn section(self) -> JcoSection {
        match self {
            Self::Parameter => JcoSection::ParameterNames,
            Self::Observation => JcoSection::ObservationNames,
        }
    }
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parameter => "parameter",
            Self::Observation => "observation",
        })
    }
}

#[derive(Debug, Error)]
pub enum JcoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of Jacobian data in {section} (item {item} of {expected})")]
    Truncated {
        section: JcoSection,
        item: u64,
        expected: u64,
    },
    #[error(
        "Jacobian file is {actual} bytes but its header (npar={npar}, nobs={nobs}, count={count}) requires {expected}"
    )]
    LengthMismatch {
        npar: u32,
        nobs: u32,
        count: u32,
        expected: u64,
        actual: u64,
    },
    #[error(
        "record {record} addresses linear index {index}, outside 1..={max} for a {nobs}x{npar} matrix"
    )]
    IndexOutOfRange {
        record: u64,
        index: i32,
        max: u64,
        nobs: usize,
        npar: usize,
    },
    #[error("{kind} name #{position} is not valid text")]
    InvalidName { kind: NameKind, position: usize },
    #[error("duplicate {kind} name '{name}'")]
    DuplicateName { kind: NameKind, name: String },
    #[error("{kind} name '{name}' does not fit the {width}-byte name field")]
    NameTooLong {
        kind: NameKind,
        name: String,
        width: usize,
    },
    #[error(
        "matrix is {rows}x{cols} but {row_names} observation and {col_names} parameter names were given"
    )]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        row_names: usize,
        col_names: usize,
    },
    #[error("a {nobs}x{npar} Jacobian is too large to address or allocate")]
    TooLarge { nobs: usize, npar: usize },
}

impl JcoError {
    /// Everything except an underlying read/write failure means the data itself is bad.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

/// A dense Jacobian labelled by observation (rows) and parameter (columns).
///
/// Built once and never mutated; the fields are private so the name indexes can
/// never drift from the name lists.
#[derive(Debug, Clone)]
pub struct JacobianMatrix {
    values: Array2<f64>,
    row_names: Vec<String>,
    col_names: Vec<String>,
    row_index: AHashMap<String, usize>,
    col_index: AHashMap<String, usize>,
}

impl JacobianMatrix {
    /// Wraps an `[nobs, npar]` array with its labels, rejecting duplicate names.
    pub fn new(
        values: Array2<f64>,
        row_names: Vec<String>,
        col_names: Vec<String>,
    ) -> Result<Self, JcoError> {
        let (rows, cols) = values.dim();
        if rows != row_names.len() || cols != col_names.len() {
            return Err(JcoError::ShapeMismatch {
                rows,
                cols,
                row_names: row_names.len(),
                col_names: col_names.len(),
            });
        }
        let row_index = build_name_index(&row_names, NameKind::Observation)?;
        let col_index = build_name_index(&col_names, NameKind::Parameter)?;
        Ok(Self {
            values,
            row_names,
            col_names,
            row_index,
            col_index,
        })
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn row_names(&self) -> &[String] {
        &self.row_names
    }

    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }

    pub fn nobs(&self) -> usize {
        self.values.nrows()
    }

    pub fn npar(&self) -> usize {
        self.values.ncols()
    }

    pub fn row_index(&self, observation: &str) -> Option<usize> {
        self.row_index.get(observation).copied()
    }

    pub fn col_index(&self, parameter: &str) -> Option<usize> {
        self.col_index.get(parameter).copied()
    }

    /// Derivatives of one observation with respect to every parameter.
    pub fn row(&self, observation: &str) -> Option<ArrayView1<'_, f64>> {
        self.row_index(observation)
            .map(|i| self.values.index_axis(Axis(0), i))
    }

    /// Derivatives of every observation with respect to one parameter.
    pub fn column(&self, parameter: &str) -> Option<ArrayView1<'_, f64>> {
        self.col_index(parameter)
            .map(|j| self.values.index_axis(Axis(1), j))
    }

    /// Writes the matrix in PEST's binary layout, one record per non-zero cell.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), JcoError> {
        let nobs = self.nobs();
        let npar = self.npar();
        let cells = nobs
            .checked_mul(npar)
            .filter(|&cells| cells <= i32::MAX as usize)
            .ok_or(JcoError::TooLarge { nobs, npar })?;
        check_name_widths(&self.col_names, NameKind::Parameter)?;
        check_name_widths(&self.row_names, NameKind::Observation)?;

        let count = self.values.iter().filter(|&&v| v != 0.0).count();
        debug_assert!(count <= cells);

        writer.write_all(&(npar as i32).to_le_bytes())?;
        writer.write_all(&(nobs as i32).to_le_bytes())?;
        writer.write_all(&(count as i32).to_le_bytes())?;

        for (col, column) in self.values.axis_iter(Axis(1)).enumerate() {
            for (row, &value) in column.iter().enumerate() {
                if value == 0.0 {
                    continue;
                }
                let linear_index = (col * nobs + row + 1) as i32;
                writer.write_all(&linear_index.to_le_bytes())?;
                writer.write_all(&value.to_le_bytes())?;
            }
        }

        for name in &self.col_names {
            write_padded_name(writer, name, PARAMETER_NAME_WIDTH)?;
        }
        for name in &self.row_names {
            write_padded_name(writer, name, OBSERVATION_NAME_WIDTH)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), JcoError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)
    }
}

/// The three header counts, already stripped of their sign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JcoHeader {
    pub npar: u32,
    pub nobs: u32,
    pub count: u32,
}

impl JcoHeader {
    fn read<R: Read>(reader: &mut R) -> Result<Self, JcoError> {
        let mut buf = [0u8; HEADER_BYTES as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|err| eof_as_truncation(err, JcoSection::Header, 0, 3))?;
        let field = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            npar: field(0).unsigned_abs(),
            nobs: field(4).unsigned_abs(),
            count: field(8).unsigned_abs(),
        })
    }

    /// Total file size implied by the header.
    pub fn encoded_len(&self) -> u64 {
        HEADER_BYTES
            + self.count as u64 * RECORD_BYTES as u64
            + self.npar as u64 * PARAMETER_NAME_WIDTH as u64
            + self.nobs as u64 * OBSERVATION_NAME_WIDTH as u64
    }
}

/// Reads a `.jco` file from disk.
pub fn decode<P: AsRef<Path>>(path: P) -> Result<JacobianMatrix, JcoError> {
    decode_with_progress(path, &mut NoopDecodeProgress)
}

/// Reads a `.jco` file from disk, reporting record progress to `observer`.
///
/// The header is checked against the file size before any record is read, so a
/// truncated file fails fast instead of after millions of records.
pub fn decode_with_progress<P, O>(path: P, observer: &mut O) -> Result<JacobianMatrix, JcoError>
where
    P: AsRef<Path>,
    O: DecodeProgressObserver + ?Sized,
{
    let path = path.as_ref();
    let file = File::open(path)?;
    let actual = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header = JcoHeader::read(&mut reader)?;
    let expected = header.encoded_len();
    if actual < expected {
        return Err(JcoError::LengthMismatch {
            npar: header.npar,
            nobs: header.nobs,
            count: header.count,
            expected,
            actual,
        });
    }
    if actual > expected {
        log::warn!(
            "{} has {} trailing bytes after the observation names; ignoring them",
            path.display(),
            actual - expected
        );
    }
    log::debug!(
        "Decoding {}: {} observations x {} parameters, {} records",
        path.display(),
        header.nobs,
        header.npar,
        header.count
    );

    decode_body(&mut reader, header, observer)
}

/// Decodes from any byte stream. An early end of stream is a format error.
pub fn decode_reader<R, O>(reader: &mut R, observer: &mut O) -> Result<JacobianMatrix, JcoError>
where
    R: Read,
    O: DecodeProgressObserver + ?Sized,
{
    let header = JcoHeader::read(reader)?;
    decode_body(reader, header, observer)
}

fn decode_body<R, O>(
    reader: &mut R,
    header: JcoHeader,
    observer: &mut O,
) -> Result<JacobianMatrix, JcoError>
where
    R: Read,
    O: DecodeProgressObserver + ?Sized,
{
    let nobs = header.nobs as usize;
    let npar = header.npar as usize;
    let cells = nobs
        .checked_mul(npar)
        .ok_or(JcoError::TooLarge { nobs, npar })?;

    let total = header.count as u64;
    let report = total > PROGRESS_RECORD_INTERVAL;
    if report {
        observer.on_start(total);
    }

    // The dense matrix is allocated only once both name tables have been read.
    let mut cells_written = Vec::new();
    let mut buf = [0u8; RECORD_BYTES];
    for record in 0..total {
        if report && record > 0 && record % PROGRESS_RECORD_INTERVAL == 0 {
            observer.on_advance(record);
        }
        reader
            .read_exact(&mut buf)
            .map_err(|err| eof_as_truncation(err, JcoSection::Records, record, total))?;

        let index = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let mut value_bytes = [0u8; 8];
        value_bytes.copy_from_slice(&buf[4..]);
        let value = f64::from_le_bytes(value_bytes);

        if index < 1 || index as u64 > cells as u64 {
            return Err(JcoError::IndexOutOfRange {
                record,
                index,
                max: cells as u64,
                nobs,
                npar,
            });
        }
        cells_written.push(((index - 1) as usize, value));
    }

    if report {
        observer.on_finish(total);
    }

    let col_names = read_names(reader, NameKind::Parameter, npar)?;
    let row_names = read_names(reader, NameKind::Observation, nobs)?;

    let mut data: Vec<f64> = Vec::new();
    data.try_reserve_exact(cells)
        .map_err(|_| JcoError::TooLarge { nobs, npar })?;
    data.resize(cells, 0.0);
    let mut values =
        Array2::from_shape_vec((nobs, npar), data).map_err(|_| JcoError::TooLarge { nobs, npar })?;
    for (zero_based, value) in cells_written {
        // Repeated cells are not validated: the last record wins.
        values[[zero_based % nobs, zero_based / nobs]] = value;
    }
    JacobianMatrix::new(values, row_names, col_names)
}

fn read_names<R: Read>(reader: &mut R, kind: NameKind, count: usize) -> Result<Vec<String>, JcoError> {
    let mut names = Vec::new();
    let mut buf = vec![0u8; kind.width()];
    for position in 0..count {
        reader.read_exact(&mut buf).map_err(|err| {
            eof_as_truncation(err, kind.section(), position as u64, count as u64)
        })?;
        let text = std::str::from_utf8(&buf).map_err(|_| JcoError::InvalidName { kind, position })?;
        names.push(normalize_name(text));
    }
    Ok(names)
}

/// Fixed-width names are space padded; PEST compares them case-insensitively.
fn normalize_name(raw: &str) -> String {
    raw.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .trim_start()
        .to_lowercase()
}

fn build_name_index(names: &[String], kind: NameKind) -> Result<AHashMap<String, usize>, JcoError> {
    let mut index = AHashMap::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        if index.insert(name.clone(), i).is_some() {
            return Err(JcoError::DuplicateName {
                kind,
                name: name.clone(),
            });
        }
    }
    Ok(index)
}

fn check_name_widths(names: &[String], kind: NameKind) -> Result<(), JcoError> {
    match names.iter().find(|name| name.len() > kind.width()) {
        Some(name) => Err(JcoError::NameTooLong {
            kind,
            name: name.clone(),
            width: kind.width(),
        }),
        None => Ok(()),
    }
}

fn write_padded_name<W: Write>(writer: &mut W, name: &str, width: usize) -> io::Result<()> {
    let bytes = name.as_bytes();
    writer.write_all(bytes)?;
    for _ in bytes.len()..width {
        writer.write_all(b" ")?;
    }
    Ok(())
}

fn eof_as_truncation(err: io::Error, section: JcoSection, item: u64, expected: u64) -> JcoError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        JcoError::Truncated {
            section,
            item,
            expected,
        }
    } else {
        JcoError::Io(err)
    }
}
