use std::{
    fs,
    io::{self, BufRead, BufReader, Read},
    num::ParseFloatError,
    path::Path,
};

use log::warn;
use thiserror::Error;

use crate::spectrum::{Spectrum, SpectrumError};

#[derive(Debug, Error)]
pub enum SpectrumReadError {
    #[error("Invalid number {token:?} after {} complete pairs: {source}", .pairs.len())]
    InvalidNumber {
        token: String,
        source: ParseFloatError,
        /// The pairs read before the bad token
        pairs: Vec<(f64, f64)>,
    },
    #[error("The spectrum could not be built: {0}")]
    Spectrum(#[from] SpectrumError),
    #[error("An IO error occurred: {0}")]
    IOError(#[from] io::Error),
}

impl SpectrumReadError {
    /// The pairs that were read successfully before the error, if any
    pub fn partial_pairs(&self) -> Option<&[(f64, f64)]> {
        match self {
            Self::InvalidNumber { pairs, .. } => Some(pairs.as_slice()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
enum XyParserState {
    #[default]
    Initial,
    Error,
    Done,
}

/**
A reader for spectrum text files. The stream is treated as a flat sequence of
whitespace separated numbers consumed two at a time as `(x, count)`, so pairs may
be split across lines or share one. A file holds exactly one spectrum, so iterating
yields at most one [`Spectrum`].

A trailing unpaired number is dropped with a warning.
*/
pub struct XyReader<R: Read> {
    handle: BufReader<R>,
    state: XyParserState,
}

const BUFFER_SIZE: usize = 8192;

impl<R: Read> XyReader<R> {
    /// Create a new [`XyReader`], wrapping the [`io::Read`] handle provided with an
    /// [`io::BufReader`].
    pub fn new(file: R) -> XyReader<R> {
        Self::with_buffer_capacity(file, BUFFER_SIZE)
    }

    pub fn with_buffer_capacity(file: R, capacity: usize) -> XyReader<R> {
        XyReader {
            handle: BufReader::with_capacity(capacity, file),
            state: XyParserState::Initial,
        }
    }

    /// Read every `(x, count)` pair remaining in the stream.
    pub fn read_pairs(&mut self) -> Result<Vec<(f64, f64)>, SpectrumReadError> {
        let mut pairs = Vec::new();
        let mut pending: Option<f64> = None;
        let mut line = String::new();
        loop {
            line.clear();
            if self.handle.read_line(&mut line)? == 0 {
                break;
            }
            for token in line.split_whitespace() {
                let value = match token.parse::<f64>() {
                    Ok(v) => v,
                    Err(source) => {
                        return Err(SpectrumReadError::InvalidNumber {
                            token: token.to_string(),
                            source,
                            pairs,
                        })
                    }
                };
                match pending.take() {
                    Some(x) => pairs.push((x, value)),
                    None => pending = Some(value),
                }
            }
        }
        if let Some(x) = pending {
            warn!("Ignoring unpaired trailing value {x} after {} pairs", pairs.len());
        }
        Ok(pairs)
    }

    /// Read the pairs and bin them into a [`Spectrum`]
    pub fn read_spectrum(&mut self) -> Result<Spectrum, SpectrumReadError> {
        let pairs = self.read_pairs()?;
        Ok(Spectrum::from_pairs(&pairs)?)
    }
}

/// [`XyReader`] is an [`Iterator`] over the single [`Spectrum`] in its stream. Errors
/// end the iteration and are logged.
impl<R: Read> Iterator for XyReader<R> {
    type Item = Spectrum;

    fn next(&mut self) -> Option<Self::Item> {
        if !matches!(self.state, XyParserState::Initial) {
            return None;
        }
        match self.read_spectrum() {
            Ok(spectrum) => {
                self.state = XyParserState::Done;
                Some(spectrum)
            }
            Err(e) => {
                warn!("Failed to read spectrum: {e}");
                self.state = XyParserState::Error;
                None
            }
        }
    }
}

/// Does `buf` start like a spectrum file, i.e. with two numbers?
pub fn is_xy(buf: &[u8]) -> bool {
    match std::str::from_utf8(buf) {
        Ok(text) => {
            let mut tokens = text.split_whitespace();
            matches!(
                (tokens.next(), tokens.next()),
                (Some(x), Some(y)) if x.parse::<f64>().is_ok() && y.parse::<f64>().is_ok()
            )
        }
        Err(_) => false,
    }
}

pub fn read_spectrum_file<P: AsRef<Path>>(path: P) -> Result<Spectrum, SpectrumReadError> {
    let handle = fs::File::open(path)?;
    XyReader::new(handle).read_spectrum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test_log::test]
    fn simple_xy() {
        let data = "0 10 1 12
 2\t 14
3 16 4
18 5 20

6 22\t\t7 24";
        let mut reader = XyReader::new(data.as_bytes());
        let pairs = reader.read_pairs().unwrap();
        assert_eq!(pairs.len(), 8);
        assert_eq!(pairs[4], (4.0, 18.0));

        let mut reader = XyReader::new(data.as_bytes());
        let spectrum = reader.next().unwrap();
        assert_eq!(spectrum.len(), 8);
        assert_eq!(spectrum.counts().iter().sum::<f64>(), 136.0);
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_bad_token_keeps_partial_pairs() {
        let data = "0 10\n1 12\n2 x\n3 16\n";
        let err = XyReader::new(data.as_bytes()).read_pairs().unwrap_err();
        assert_eq!(err.partial_pairs(), Some(&[(0.0, 10.0), (1.0, 12.0)][..]));
        assert!(matches!(err, SpectrumReadError::InvalidNumber { ref token, .. } if token == "x"));
    }

    #[test]
    fn test_trailing_value_is_dropped() {
        let pairs = XyReader::new("0 1 2 3 4".as_bytes()).read_pairs().unwrap();
        assert_eq!(pairs, vec![(0.0, 1.0), (2.0, 3.0)]);
    }

    #[test]
    fn test_is_xy() {
        assert!(is_xy(b"0 15\n1 20\n"));
        assert!(is_xy(b"  0\t15"));
        assert!(!is_xy(b"channel count\n"));
        assert!(!is_xy(b"0"));
    }
}
