//! Sweep output file.
//!
//! Plain text, one line per accepted sample:
//!
//! ```text
//! #Frequency[Hz]  E1r  E2r  TanD  Cp
//! # Area=10[mm^2] Thickness=1[mm] C0=8.854e-14[F]
//! # <description line>
//!           20      225.887      4.51773         0.02        2e-11
//! ```
//!
//! Numbers use the shortest of fixed or exponent notation with six
//! significant digits, right-aligned in 12 columns. Every line is flushed as
//! soon as it is written so an interrupted sweep keeps its samples.

use super::sample::Permittivity;
use crate::error::{AppResult, DaqError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column header of the output file.
pub const HEADER: &str = "#Frequency[Hz]  E1r  E2r  TanD  Cp";

const SIGNIFICANT_DIGITS: i32 = 6;
const COLUMN_WIDTH: usize = 12;

fn strip_fraction_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Formats `value` like C's `%g` with six significant digits.
///
/// ```
/// use dielectric_daq::acquisition::output::format_g;
///
/// assert_eq!(format_g(1.0e6), "1e+06");
/// assert_eq!(format_g(20.0), "20");
/// assert_eq!(format_g(225.8866), "225.887");
/// assert_eq!(format_g(8.854e-14), "8.854e-14");
/// ```
pub fn format_g(value: f64) -> String {
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let precision = SIGNIFICANT_DIGITS as usize - 1;
    let scientific = format!("{:.*e}", precision, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return scientific;
    };

    if exponent < -4 || exponent >= SIGNIFICANT_DIGITS {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{}{:02}",
            strip_fraction_zeros(mantissa),
            sign,
            exponent.abs()
        )
    } else {
        let decimals = (SIGNIFICANT_DIGITS - 1 - exponent) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

/// One data line for `point`, without the newline.
pub fn format_line(point: &Permittivity) -> String {
    [point.frequency, point.e1, point.e2, point.tan_d, point.cp]
        .iter()
        .map(|v| format!("{:>width$}", format_g(*v), width = COLUMN_WIDTH))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Open output file of a running sweep.
#[derive(Debug)]
pub struct SweepWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

impl SweepWriter {
    /// Creates (or truncates) `path` and writes the header block.
    ///
    /// Missing parent directories are created.
    pub fn create(
        path: &Path,
        area_mm2: f64,
        thickness_mm: f64,
        c0: f64,
        description: &str,
    ) -> AppResult<Self> {
        let file_error = |source| DaqError::File {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(file_error)?;
        }
        let file = File::create(path).map_err(file_error)?;
        let mut writer = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            lines: 0,
        };

        let mut header = format!(
            "{}\n# Area={}[mm^2] Thickness={}[mm] C0={}[F]\n",
            HEADER,
            format_g(area_mm2),
            format_g(thickness_mm),
            format_g(c0)
        );
        for line in description.lines() {
            header.push_str("# ");
            header.push_str(line);
            header.push('\n');
        }
        writer.write_raw(&header)?;

        info!("Writing sweep to {}", path.display());
        Ok(writer)
    }

    fn write_raw(&mut self, text: &str) -> AppResult<()> {
        self.writer
            .write_all(text.as_bytes())
            .and_then(|()| self.writer.flush())
            .map_err(|source| DaqError::File {
                path: self.path.clone(),
                source,
            })
    }

    /// Appends one sample line and flushes it.
    pub fn write_point(&mut self, point: &Permittivity) -> AppResult<()> {
        let line = format_line(point);
        self.write_raw(&format!("{}\n", line))?;
        self.lines += 1;
        debug!("{}", line);
        Ok(())
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of data lines written.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Flushes and closes the file, returning its path.
    pub fn finish(mut self) -> AppResult<PathBuf> {
        self.writer.flush().map_err(|source| DaqError::File {
            path: self.path.clone(),
            source,
        })?;
        info!("{} lines written to {}", self.lines, self.path.display());
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_g_ranges() {
        assert_eq!(format_g(0.0), "0");
        assert_eq!(format_g(0.02), "0.02");
        assert_eq!(format_g(0.0001), "0.0001");
        assert_eq!(format_g(0.00001), "1e-05");
        assert_eq!(format_g(123456.0), "123456");
        assert_eq!(format_g(1234567.0), "1.23457e+06");
        assert_eq!(format_g(-2.5e-11), "-2.5e-11");
        assert_eq!(format_g(655360.0), "655360");
    }

    #[test]
    fn test_line_layout() {
        let point = Permittivity {
            frequency: 20.0,
            e1: 225.8866,
            e2: 4.517732,
            tan_d: 0.02,
            cp: 2.0e-11,
        };
        let line = format_line(&point);
        assert_eq!(
            line,
            "          20      225.887      4.51773         0.02        2e-11"
        );
    }

    #[test]
    fn test_header_and_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sweep.dat");
        let mut writer =
            SweepWriter::create(&path, 10.0, 1.0, 8.854e-14, "PVDF film\nannealed").unwrap();
        writer
            .write_point(&Permittivity {
                frequency: 40.0,
                e1: 3.0,
                e2: 0.06,
                tan_d: 0.02,
                cp: 2.6562e-13,
            })
            .unwrap();

        // Flushed before the writer is finished.
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "# Area=10[mm^2] Thickness=1[mm] C0=8.854e-14[F]");
        assert_eq!(lines[2], "# PVDF film");
        assert_eq!(lines[3], "# annealed");
        assert_eq!(lines.len(), 5);
        assert_eq!(writer.lines(), 1);
        assert_eq!(writer.finish().unwrap(), path);
    }

    #[test]
    fn test_create_failure_is_file_error() {
        let dir = tempdir().unwrap();
        let err = SweepWriter::create(dir.path(), 1.0, 1.0, 1.0, "").unwrap_err();
        assert!(matches!(err, DaqError::File { .. }));
    }
}
