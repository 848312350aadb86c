//! Reading and writing reconstruction matrix files.
//!
//! A matrix file is one opaque header line followed by whitespace-delimited
//! rows of five integer exponents and four real coefficients:
//!
//! ```text
//! <header, echoed verbatim>
//!  0 0 0 0 0  1.234567890e-03 -2.000000000e-02  0.000000000e+00  5.000000000e-01
//!  1 0 0 0 0  ...
//! ```
//!
//! Exponent order is `x_fp xp_fp y_fp yp_fp x_tar`; coefficient order is
//! `xpTar yTar ypTar delta`. Blank lines are ignored. Coefficients are written
//! in C-style `%17.9e` so files produced here diff cleanly against files
//! produced by the legacy tooling.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};

use super::{Coefficients, PolynomialTerm, ReconstructionMatrix};
use crate::error::{OpticsError, Result};

/// Field width used for every written coefficient.
const FIELD_WIDTH: usize = 17;
/// Digits after the decimal point for written coefficients.
const PRECISION: usize = 9;

/// Parse matrix text. `source` names the origin in error messages.
pub fn parse_matrix(text: &str, source: &str) -> Result<ReconstructionMatrix> {
    let mut lines = text.lines().enumerate();
    let header = match lines.next() {
        Some((_, header)) => header,
        None => return Err(OpticsError::format(source, 1, "missing header line")),
    };

    let mut matrix = ReconstructionMatrix::new(header);
    let mut seen = HashSet::new();

    for (idx, line) in lines {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 9 {
            return Err(OpticsError::format(
                source,
                line_no,
                format!("expected 9 fields, found {}", fields.len()),
            ));
        }

        let mut exps = [0u32; 5];
        for (e, field) in exps.iter_mut().zip(&fields[..5]) {
            *e = field.parse().map_err(|_| {
                OpticsError::format(
                    source,
                    line_no,
                    format!("exponent `{field}` is not a non-negative integer"),
                )
            })?;
        }

        let mut coeffs = [0f64; 4];
        for (c, field) in coeffs.iter_mut().zip(&fields[5..]) {
            *c = field.parse().map_err(|_| {
                OpticsError::format(
                    source,
                    line_no,
                    format!("coefficient `{field}` is not a number"),
                )
            })?;
        }

        let term = PolynomialTerm::new(exps[0], exps[1], exps[2], exps[3], exps[4]);
        if !seen.insert(term) {
            return Err(OpticsError::format(
                source,
                line_no,
                format!("duplicate term {term}"),
            ));
        }
        matrix.push_row(
            term,
            Coefficients {
                xp_tar: coeffs[0],
                y_tar: coeffs[1],
                yp_tar: coeffs[2],
                delta: coeffs[3],
            },
        );
    }

    Ok(matrix)
}

/// Read and parse a matrix file.
pub fn read_matrix_file<P: AsRef<Path>>(path: P) -> Result<ReconstructionMatrix> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| OpticsError::io(path, e))?;
    parse_matrix(&text, &path.display().to_string())
}

/// Render a matrix in file format.
pub fn format_matrix(matrix: &ReconstructionMatrix) -> String {
    let mut out = String::with_capacity(matrix.header().len() + 1 + matrix.len() * 80);
    out.push_str(matrix.header());
    out.push('\n');
    for row in matrix.rows() {
        let t = &row.term;
        out.push_str(&format!(
            " {} {} {} {} {}",
            t.e_x, t.e_xp, t.e_y, t.e_yp, t.e_xtar
        ));
        for c in [
            row.coeffs.xp_tar,
            row.coeffs.y_tar,
            row.coeffs.yp_tar,
            row.coeffs.delta,
        ] {
            out.push_str(&format!(
                "{:>width$}",
                format_scientific(c, PRECISION),
                width = FIELD_WIDTH
            ));
        }
        out.push('\n');
    }
    out
}

/// Write a matrix file.
pub fn write_matrix_file<P: AsRef<Path>>(path: P, matrix: &ReconstructionMatrix) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, format_matrix(matrix)).map_err(|e| OpticsError::io(path, e))
}

/// Format like C's `%.{precision}e`: mantissa, lowercase `e`, signed exponent
/// with at least two digits.
pub fn format_scientific(value: f64, precision: usize) -> String {
    if !value.is_finite() {
        return value.to_string().to_lowercase();
    }
    let s = format!("{value:.precision$e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => s,
    }
}

// ── Diagnostic dumps ────────────────────────────────────────────────────────

/// Dump a fit right-hand-side vector, one `%17.9e` value per line.
pub fn write_fit_vector<P: AsRef<Path>>(path: P, vector: &DVector<f64>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| OpticsError::io(path, e))?;
    let mut w = BufWriter::new(file);
    for v in vector.iter() {
        writeln!(
            w,
            "{:>width$}",
            format_scientific(*v, PRECISION),
            width = FIELD_WIDTH
        )
        .map_err(|e| OpticsError::io(path, e))?;
    }
    w.flush().map_err(|e| OpticsError::io(path, e))
}

/// Dump a fit matrix, one row per line of `%17.9e` fields.
pub fn write_fit_matrix<P: AsRef<Path>>(path: P, matrix: &DMatrix<f64>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| OpticsError::io(path, e))?;
    let mut w = BufWriter::new(file);
    for row in matrix.row_iter() {
        let mut line = String::with_capacity(row.len() * FIELD_WIDTH);
        for v in row.iter() {
            line.push_str(&format!(
                "{:>width$}",
                format_scientific(*v, PRECISION),
                width = FIELD_WIDTH
            ));
        }
        writeln!(w, "{line}").map_err(|e| OpticsError::io(path, e))?;
    }
    w.flush().map_err(|e| OpticsError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "! SHMS optics matrix, run 1234 -- keep me exactly\n\
         0 0 0 0 0  1.000000000e-03 -2.500000000e-02  3.000000000e-04  0.000000000e+00\n\
         1 0 0 0 0 -1.234567890e+00  0.000000000e+00  4.400000000e-01  1.000000000e+00\n\
         \n\
         0 0 0 1 1  7.000000000e-05  1.000000000e+00 -9.999999999e+10  2.000000000e-03\n";

    #[test]
    fn test_format_scientific() {
        assert_eq!(format_scientific(0.001234, 9), "1.234000000e-03");
        assert_eq!(format_scientific(-12345.678, 3), "-1.235e+04");
        assert_eq!(format_scientific(0.0, 9), "0.000000000e+00");
        assert_eq!(format_scientific(1.5e-120, 2), "1.50e-120");
        assert_eq!(format_scientific(f64::NAN, 9), "nan");
    }

    #[test]
    fn test_parse_sample() {
        let m = parse_matrix(SAMPLE, "sample").unwrap();
        assert_eq!(m.header(), "! SHMS optics matrix, run 1234 -- keep me exactly");
        assert_eq!(m.len(), 3);
        assert_eq!(m.rows()[1].term, PolynomialTerm::new(1, 0, 0, 0, 0));
        assert!((m.rows()[1].coeffs.xp_tar + 1.23456789).abs() < 1e-15);
        assert!(m.rows()[2].term.is_dependent());
        assert!((m.rows()[2].coeffs.yp_tar + 9.999999999e10).abs() < 1e-3);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let m = parse_matrix(SAMPLE, "sample").unwrap();
        let text = format_matrix(&m);
        let again = parse_matrix(&text, "formatted").unwrap();
        assert_eq!(format_matrix(&again), text);
        assert_eq!(again.header(), m.header());
        assert!(text.starts_with("! SHMS optics matrix, run 1234 -- keep me exactly\n"));
    }

    #[test]
    fn test_wrong_field_count() {
        let text = "header\n 0 0 0 0 0 1.0 2.0 3.0\n";
        match parse_matrix(text, "bad") {
            Err(OpticsError::Format { line, reason, .. }) => {
                assert_eq!(line, 2);
                assert!(reason.contains("expected 9 fields"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_exponent() {
        for bad in ["-1", "x", "1.5"] {
            let text = format!("header\n 0 {bad} 0 0 0 1.0 2.0 3.0 4.0\n");
            assert!(matches!(
                parse_matrix(&text, "bad"),
                Err(OpticsError::Format { line: 2, .. })
            ));
        }
    }

    #[test]
    fn test_bad_coefficient_and_duplicate() {
        let text = "header\n 0 0 0 0 0 1.0 abc 3.0 4.0\n";
        assert!(matches!(
            parse_matrix(text, "bad"),
            Err(OpticsError::Format { line: 2, .. })
        ));
        let text = "header\n 0 0 0 0 0 1 2 3 4\n\n 0 0 0 0 0 1 2 3 4\n";
        assert!(matches!(
            parse_matrix(text, "dup"),
            Err(OpticsError::Format { line: 4, .. })
        ));
    }

    #[test]
    fn test_empty_file_is_format_error() {
        assert!(matches!(
            parse_matrix("", "empty"),
            Err(OpticsError::Format { line: 1, .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let path = std::env::temp_dir().join("shms_optics_no_such_matrix_file.dat");
        assert!(matches!(
            read_matrix_file(&path),
            Err(OpticsError::Io { .. })
        ));
    }

    #[test]
    fn test_file_round_trip_and_dumps() {
        let dir = std::env::temp_dir().join(format!("shms_optics_io_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let m = parse_matrix(SAMPLE, "sample").unwrap();
        let path = dir.join("matrix.dat");
        write_matrix_file(&path, &m).unwrap();
        let back = read_matrix_file(&path).unwrap();
        assert_eq!(format_matrix(&back), format_matrix(&m));

        let vec_path = dir.join("xpVec.txt");
        write_fit_vector(&vec_path, &DVector::from_vec(vec![1.0, -0.5])).unwrap();
        let text = std::fs::read_to_string(&vec_path).unwrap();
        assert_eq!(text, "  1.000000000e+00\n -5.000000000e-01\n");

        let mat_path = dir.join("xpMat.txt");
        write_fit_matrix(&mat_path, &DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        let text = std::fs::read_to_string(&mat_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "  3.000000000e+00  4.000000000e+00");

        std::fs::remove_dir_all(&dir).ok();
    }
}
