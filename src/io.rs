//! Reading spectra and three-column calibration tables from text streams.
//!
//! Spectrum files are flat streams of `<x> <count>` tokens, see [`xy`]. Calibration and
//! efficiency tables are whitespace separated rows of `<x> <value> <uncertainty>`, see
//! [`table`]. Both readers stop at the first malformed entry and hand back everything
//! read before it inside the error, leaving the caller to decide whether to proceed.
pub mod table;
pub mod xy;

pub use table::{read_table, read_table_file, TableError, TableRow, TableWriter};
pub use xy::{is_xy, read_spectrum_file, SpectrumReadError, XyReader};
