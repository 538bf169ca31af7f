use std::{
    fs,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    num::ParseFloatError,
    path::Path,
};

use log::debug;
use thiserror::Error;

/// One row of a calibration or efficiency table
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableRow {
    /// Channel or energy
    pub x: f64,
    /// Energy or efficiency
    pub value: f64,
    pub uncertainty: f64,
}

impl TableRow {
    pub fn new(x: f64, value: f64, uncertainty: f64) -> Self {
        Self {
            x,
            value,
            uncertainty,
        }
    }
}

pub const TABLE_COLUMNS: usize = 3;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Line {line} has {found} columns, expected {expected}", expected = TABLE_COLUMNS)]
    MalformedRow {
        line: usize,
        found: usize,
        /// Rows read before the malformed one
        rows: Vec<TableRow>,
    },
    #[error("Line {line} holds an invalid number {token:?}: {source}")]
    InvalidNumber {
        line: usize,
        token: String,
        source: ParseFloatError,
        rows: Vec<TableRow>,
    },
    #[error("An IO error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl TableError {
    /// The rows that were read successfully before the error, if any
    pub fn partial_rows(&self) -> Option<&[TableRow]> {
        match self {
            Self::MalformedRow { rows, .. } | Self::InvalidNumber { rows, .. } => Some(rows.as_slice()),
            Self::IOError(_) => None,
        }
    }

    /// Take the successfully read rows out of the error
    pub fn into_partial_rows(self) -> Vec<TableRow> {
        match self {
            Self::MalformedRow { rows, .. } | Self::InvalidNumber { rows, .. } => rows,
            Self::IOError(_) => Vec::new(),
        }
    }
}

/// Read whitespace separated `<x> <value> <uncertainty>` rows. Blank lines are skipped.
pub fn read_table<R: Read>(source: R) -> Result<Vec<TableRow>, TableError> {
    let mut handle = BufReader::new(source);
    let mut rows = Vec::new();
    let mut line = String::new();
    let mut line_number = 0;
    loop {
        line.clear();
        if handle.read_line(&mut line)? == 0 {
            break;
        }
        line_number += 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != TABLE_COLUMNS {
            return Err(TableError::MalformedRow {
                line: line_number,
                found: tokens.len(),
                rows,
            });
        }
        let mut values = [0.0; TABLE_COLUMNS];
        for (slot, token) in values.iter_mut().zip(tokens.iter()) {
            match token.parse::<f64>() {
                Ok(v) => *slot = v,
                Err(source) => {
                    return Err(TableError::InvalidNumber {
                        line: line_number,
                        token: token.to_string(),
                        source,
                        rows,
                    })
                }
            }
        }
        rows.push(TableRow::new(values[0], values[1], values[2]));
    }
    debug!("Read {} table rows", rows.len());
    Ok(rows)
}

pub fn read_table_file<P: AsRef<Path>>(path: P) -> Result<Vec<TableRow>, TableError> {
    read_table(fs::File::open(path)?)
}

/// Writes table rows in ascending `x` order with fixed precision.
pub struct TableWriter<W: Write> {
    handle: BufWriter<W>,
    pub precision: usize,
}

impl<W: Write> TableWriter<W> {
    pub fn new(file: W) -> TableWriter<W> {
        TableWriter {
            handle: BufWriter::new(file),
            precision: 2,
        }
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn write_rows(&mut self, rows: &[TableRow]) -> io::Result<()> {
        let mut sorted = rows.to_vec();
        sorted.sort_by(|a, b| a.x.total_cmp(&b.x));
        let p = self.precision;
        for row in sorted.iter() {
            writeln!(
                self.handle,
                "{:.p$} {:.p$} {:.p$}",
                row.x, row.value, row.uncertainty
            )?;
        }
        self.handle.flush()
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.handle.into_inner().map_err(|e| e.into_error())
    }
}
