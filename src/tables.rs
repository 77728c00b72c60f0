//! Plain-text numeric tables
//!
//! Response functions, balance factors and FSL-style gradient files are
//! whitespace- (or comma-) separated numbers, one row per line. Lines
//! starting with `#` are comments.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{Error, Result};
use crate::volume::{BalanceFactors, GradientTable, Tissue, TissueResponse};

/// Parse a numeric table, skipping comments and blank lines
pub fn parse_table(text: &str) -> std::result::Result<Vec<Vec<f64>>, String> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|tok| !tok.is_empty())
            .map(|tok| {
                tok.parse::<f64>()
                    .map_err(|_| format!("line {}: '{}' is not a number", lineno + 1, tok))
            })
            .collect::<std::result::Result<Vec<f64>, String>>()?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn format_table(rows: &[Vec<f64>]) -> String {
    let mut out = String::new();
    for row in rows {
        let parts: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
        let _ = writeln!(out, "{}", parts.join(" "));
    }
    out
}

fn read_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_table(&text).map_err(|message| Error::Table {
        path: path.to_path_buf(),
        message,
    })
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a response function file
pub fn read_response(path: &Path, tissue: Tissue) -> Result<TissueResponse> {
    let rows = read_table(path)?;
    if rows.is_empty() || rows.iter().any(|r| r.is_empty()) {
        return Err(Error::Table {
            path: path.to_path_buf(),
            message: "response file holds no coefficients".to_string(),
        });
    }
    Ok(TissueResponse::new(tissue, rows))
}

pub fn write_response(path: &Path, response: &TissueResponse) -> Result<()> {
    write_text(path, &format_table(&response.coefficients))
}

/// Read balance factors, assigned to `tissues` in order
pub fn read_balance_factors(path: &Path, tissues: &[Tissue]) -> Result<BalanceFactors> {
    let values: Vec<f64> = read_table(path)?.into_iter().flatten().collect();
    if values.len() != tissues.len() {
        return Err(Error::Table {
            path: path.to_path_buf(),
            message: format!("expected {} balance factors, found {}", tissues.len(), values.len()),
        });
    }
    Ok(BalanceFactors::new(tissues.iter().copied().zip(values).collect()))
}

/// Write FSL `bvecs` (3 rows) and `bvals` (1 row)
pub fn write_fsl_gradients(bvecs: &Path, bvals: &Path, gradients: &GradientTable) -> Result<()> {
    let rows = gradients.rows();
    let vecs: Vec<Vec<f64>> = (0..3).map(|axis| rows.iter().map(|r| r[axis]).collect()).collect();
    write_text(bvecs, &format_table(&vecs))?;
    write_text(bvals, &format_table(&[rows.iter().map(|r| r[3]).collect()]))
}

/// Read FSL `bvecs`/`bvals`; bvecs may be stored as 3 rows or 3 columns
pub fn read_fsl_gradients(bvecs: &Path, bvals: &Path) -> Result<GradientTable> {
    let vecs = read_table(bvecs)?;
    let vals: Vec<f64> = read_table(bvals)?.into_iter().flatten().collect();
    let n = vals.len();

    let bad = |message: String| Error::Table { path: bvecs.to_path_buf(), message };
    let column = |i: usize| -> Option<[f64; 3]> {
        if vecs.len() == 3 && vecs.iter().all(|r| r.len() == n) {
            Some([vecs[0][i], vecs[1][i], vecs[2][i]])
        } else if vecs.len() == n && vecs.iter().all(|r| r.len() == 3) {
            Some([vecs[i][0], vecs[i][1], vecs[i][2]])
        } else {
            None
        }
    };

    let mut rows = Vec::with_capacity(n);
    for (i, &b) in vals.iter().enumerate() {
        let [x, y, z] = column(i)
            .ok_or_else(|| bad(format!("bvecs do not match {} b-values", n)))?;
        rows.push([x, y, z, b]);
    }
    Ok(GradientTable::new(rows))
}
