//! Symbolic matrices
//!
//! A [`SymbolicMatrix`] is a dense matrix whose cells are either constants or
//! parsed [`Expr`] trees. Evaluating it against a [`Binding`] yields a numeric
//! `DMatrix`; evaluation keeps no state between calls.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::binding::Binding;
use super::expression::{EvaluationError, Expr};
use crate::ConfigError;

/// A matrix cell as written in a configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellSpec {
    Number(f64),
    Expression(String),
}

impl From<f64> for CellSpec {
    fn from(value: f64) -> Self {
        CellSpec::Number(value)
    }
}

impl From<&str> for CellSpec {
    fn from(source: &str) -> Self {
        CellSpec::Expression(source.to_string())
    }
}

/// Row-major matrix specification.
pub type MatrixSpec = Vec<Vec<CellSpec>>;

/// Builds a [`MatrixSpec`] from rows of anything convertible to a cell.
///
/// ```
/// use imm_tracker::types::symbolic::matrix_spec;
/// let f = matrix_spec(vec![vec!["1", "dt"], vec!["0", "1"]]);
/// assert_eq!(f.len(), 2);
/// ```
pub fn matrix_spec<C: Into<CellSpec>>(rows: Vec<Vec<C>>) -> MatrixSpec {
    rows.into_iter()
        .map(|row| row.into_iter().map(Into::into).collect())
        .collect()
}

/// A parsed matrix cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Constant(f64),
    Expression(Expr),
}

/// A matrix whose cells may depend on bound variables.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl SymbolicMatrix {
    /// Parses a matrix specification.
    ///
    /// String cells that are plain numbers become constants. An empty
    /// specification yields a 0×0 matrix.
    ///
    /// # Errors
    /// `ConfigError::MalformedMatrix` if rows differ in length, a cell does
    /// not parse, or a constant cell is infinite or NaN.
    pub fn parse(name: &str, spec: &[Vec<CellSpec>]) -> Result<Self, ConfigError> {
        let rows = spec.len();
        let cols = spec.first().map_or(0, Vec::len);

        let malformed = |reason: String| ConfigError::MalformedMatrix {
            matrix: name.to_string(),
            reason,
        };

        let mut cells = Vec::with_capacity(rows * cols);
        for (r, row) in spec.iter().enumerate() {
            if row.len() != cols {
                return Err(malformed(format!(
                    "row {r} has {} cells, expected {cols}",
                    row.len()
                )));
            }
            for (c, cell) in row.iter().enumerate() {
                let parsed = match cell {
                    CellSpec::Number(value) => Cell::Constant(*value),
                    CellSpec::Expression(source) => match source.trim().parse::<f64>() {
                        Ok(value) => Cell::Constant(value),
                        Err(_) => Cell::Expression(
                            Expr::parse(source).map_err(|e| malformed(e.to_string()))?,
                        ),
                    },
                };
                if let Cell::Constant(value) = parsed {
                    if !value.is_finite() {
                        return Err(malformed(format!("cell ({r}, {c}) is {value}")));
                    }
                }
                cells.push(parsed);
            }
        }

        if cols == 0 {
            return Ok(Self::empty());
        }

        Ok(Self { rows, cols, cells })
    }

    /// Creates a constant symbolic matrix from numeric values.
    pub fn from_numeric(matrix: &DMatrix<f64>) -> Self {
        let mut cells = Vec::with_capacity(matrix.len());
        for r in 0..matrix.nrows() {
            for c in 0..matrix.ncols() {
                cells.push(Cell::Constant(matrix[(r, c)]));
            }
        }
        Self {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            cells,
        }
    }

    /// A 0×0 matrix, used for absent optional matrices.
    pub fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            cells: Vec::new(),
        }
    }

    /// Returns `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns `true` if no cell references a variable.
    pub fn is_constant(&self) -> bool {
        self.cells.iter().all(|c| matches!(c, Cell::Constant(_)))
    }

    /// Names of all variables referenced by any cell.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        for cell in &self.cells {
            if let Cell::Expression(expr) = cell {
                expr.variables(&mut out);
            }
        }
        out
    }

    /// Evaluates every cell against the binding.
    pub fn evaluate(&self, binding: &Binding) -> Result<DMatrix<f64>, EvaluationError> {
        let mut values = Vec::with_capacity(self.cells.len());
        for cell in &self.cells {
            values.push(match cell {
                Cell::Constant(value) => *value,
                Cell::Expression(expr) => expr.evaluate(binding)?,
            });
        }
        Ok(DMatrix::from_row_slice(self.rows, self.cols, &values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_matrix_round_trip() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = SymbolicMatrix::from_numeric(&m);
        assert!(s.is_constant());
        assert_eq!(s.evaluate(&Binding::new()).unwrap(), m);
    }

    #[test]
    fn test_time_dependent_transition() {
        let spec = matrix_spec(vec![
            vec!["1", "dt", "dt^2/2"],
            vec!["0", "1", "dt"],
            vec!["0", "0", "1"],
        ]);
        let f = SymbolicMatrix::parse("transition_matrix", &spec).unwrap();
        assert!(!f.is_constant());
        assert_eq!(f.variables(), vec!["dt".to_string()]);

        let m = f.evaluate(&Binding::new().with("dt", 2.0)).unwrap();
        assert_eq!(m[(0, 1)], 2.0);
        assert_eq!(m[(0, 2)], 2.0);
        assert_eq!(m[(1, 2)], 2.0);
        assert_eq!(m[(2, 2)], 1.0);
        assert_eq!(m[(1, 0)], 0.0);
    }

    #[test]
    fn test_mixed_number_and_expression_cells() {
        let spec = vec![
            vec![CellSpec::Number(1.0), CellSpec::Expression("sigma_a_sq".into())],
            vec![CellSpec::Expression(" 0.5 ".into()), CellSpec::Number(2.0)],
        ];
        let s = SymbolicMatrix::parse("m", &spec).unwrap();
        assert_eq!(s.variables(), vec!["sigma_a_sq".to_string()]);
        let m = s.evaluate(&Binding::new().with("sigma_a_sq", 3.0)).unwrap();
        assert_eq!(m, DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 0.5, 2.0]));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let spec = matrix_spec(vec![vec![1.0, 2.0], vec![3.0]]);
        let err = SymbolicMatrix::parse("bad", &spec).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedMatrix { .. }));
    }

    #[test]
    fn test_non_finite_constants_rejected() {
        for cell in ["inf", "-inf", "NaN", " infinity "] {
            let spec = matrix_spec(vec![vec!["1", cell]]);
            let err = SymbolicMatrix::parse("r", &spec).unwrap_err();
            assert!(matches!(err, ConfigError::MalformedMatrix { .. }), "{cell}: {err:?}");
        }
        let spec = vec![vec![CellSpec::Number(f64::INFINITY)]];
        assert!(SymbolicMatrix::parse("r", &spec).is_err());
    }

    #[test]
    fn test_bad_expression_rejected() {
        let spec = matrix_spec(vec![vec!["dt +"]]);
        assert!(SymbolicMatrix::parse("bad", &spec).is_err());
    }

    #[test]
    fn test_unknown_variable_fails_evaluation() {
        let spec = matrix_spec(vec![vec!["omega*dt"]]);
        let s = SymbolicMatrix::parse("m", &spec).unwrap();
        let err = s.evaluate(&Binding::new().with("dt", 1.0)).unwrap_err();
        assert_eq!(err, EvaluationError::UnknownVariable("omega".into()));
    }

    #[test]
    fn test_noise_scale_division_convention() {
        let spec = matrix_spec(vec![vec!["sigma_a_sq / sigma_a_sq"]]);
        let s = SymbolicMatrix::parse("q", &spec).unwrap();
        let m = s.evaluate(&Binding::new().with("sigma_a_sq", 0.0)).unwrap();
        assert_eq!(m[(0, 0)], 0.0);
    }

    #[test]
    fn test_empty_matrix() {
        let s = SymbolicMatrix::parse("g", &[]).unwrap();
        assert!(s.is_empty());
        assert_eq!(s.evaluate(&Binding::new()).unwrap().shape(), (0, 0));
    }
}
