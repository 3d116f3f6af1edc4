//! Mapping between filter-native and common state spaces
//!
//! Filters in one bank may track different subsets of the kinematic state
//! (e.g. a 4-state constant velocity model next to a 6-state constant
//! acceleration model). The mixer works in the common space; a
//! [`StateSpaceAdapter`] expands native estimates into it and shrinks mixed
//! estimates back out.
//!
//! Expansion pads a native vector with ones up to the common dimension and
//! applies the square expansion matrix. Covariances are padded with an
//! identity block and mapped with the covariance expansion matrix, so that
//! entries of that matrix set the variance of components the native model
//! does not carry. Shrinking applies the rectangular shrinking matrix.

use nalgebra::{DMatrix, DVector};

use super::linalg::{ensure_len, ensure_shape};
use crate::{ConfigError, ImmError, Result};

/// Linear maps between one native dimensionality and the common one.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpaceAdapter {
    common_dim: usize,
    maps: Option<Maps>,
}

#[derive(Debug, Clone, PartialEq)]
struct Maps {
    expansion: DMatrix<f64>,
    expansion_covariance: DMatrix<f64>,
    shrinking: DMatrix<f64>,
}

impl StateSpaceAdapter {
    /// Adapter for a bank whose filters all use the common dimension.
    pub fn identity(common_dim: usize) -> Self {
        Self {
            common_dim,
            maps: None,
        }
    }

    /// Creates an adapter from numeric maps.
    ///
    /// # Arguments
    /// * `expansion` - N×N, applied to ones-padded native states
    /// * `expansion_covariance` - N×N, defaults to `expansion`
    /// * `shrinking` - n×N with n < N, the native dimension supported
    pub fn new(
        expansion: DMatrix<f64>,
        expansion_covariance: Option<DMatrix<f64>>,
        shrinking: DMatrix<f64>,
    ) -> ::core::result::Result<Self, ConfigError> {
        let n = expansion.nrows();
        let mismatch = |context: &str, expected: String, actual: (usize, usize)| {
            ConfigError::DimensionMismatch {
                context: context.to_string(),
                expected,
                actual: format!("{}x{}", actual.0, actual.1),
            }
        };

        if expansion.ncols() != n {
            return Err(mismatch("expansion_matrix", format!("{n}x{n}"), expansion.shape()));
        }
        let expansion_covariance = expansion_covariance.unwrap_or_else(|| expansion.clone());
        if expansion_covariance.shape() != (n, n) {
            return Err(mismatch(
                "expansion_matrix_covariance",
                format!("{n}x{n}"),
                expansion_covariance.shape(),
            ));
        }
        if shrinking.ncols() != n || shrinking.nrows() == 0 || shrinking.nrows() >= n {
            return Err(mismatch("shrinking_matrix", format!("mx{n} with m<{n}"), shrinking.shape()));
        }

        Ok(Self {
            common_dim: n,
            maps: Some(Maps {
                expansion,
                expansion_covariance,
                shrinking,
            }),
        })
    }

    /// Dimension of the common state space.
    #[inline]
    pub fn common_dim(&self) -> usize {
        self.common_dim
    }

    /// The reduced native dimension this adapter converts, if any.
    pub fn native_dim(&self) -> Option<usize> {
        self.maps.as_ref().map(|m| m.shrinking.nrows())
    }

    /// Returns `true` if a filter of dimension `dim` can join the bank.
    pub fn supports(&self, dim: usize) -> bool {
        dim == self.common_dim || self.native_dim() == Some(dim)
    }

    fn maps_for(&self, context: &str, dim: usize) -> Result<&Maps> {
        match &self.maps {
            Some(maps) if maps.shrinking.nrows() == dim => Ok(maps),
            _ => Err(ImmError::DimensionMismatch {
                context: context.to_string(),
                expected: match self.native_dim() {
                    Some(native) => format!("{} or {native}", self.common_dim),
                    None => self.common_dim.to_string(),
                },
                actual: dim.to_string(),
            }),
        }
    }

    /// Maps a native state vector into the common space.
    pub fn expand_state(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        if x.len() == self.common_dim {
            return Ok(x.clone());
        }
        let maps = self.maps_for("expand state", x.len())?;

        let mut padded = DVector::from_element(self.common_dim, 1.0);
        padded.rows_mut(0, x.len()).copy_from(x);

        Ok(&maps.expansion * padded)
    }

    /// Maps a native covariance into the common space.
    pub fn expand_covariance(&self, p: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if p.nrows() == self.common_dim {
            ensure_shape("expand covariance", p, self.common_dim, self.common_dim)?;
            return Ok(p.clone());
        }
        let n = p.nrows();
        ensure_shape("expand covariance", p, n, n)?;
        let maps = self.maps_for("expand covariance", n)?;

        let mut padded = DMatrix::<f64>::identity(self.common_dim, self.common_dim);
        padded.view_mut((0, 0), (n, n)).copy_from(p);

        let e = &maps.expansion_covariance;
        Ok(e * padded * e.transpose())
    }

    /// Maps a common-space state vector to a filter of dimension `dim`.
    pub fn shrink_state(&self, x: &DVector<f64>, dim: usize) -> Result<DVector<f64>> {
        ensure_len("shrink state", x, self.common_dim)?;
        if dim == self.common_dim {
            return Ok(x.clone());
        }
        let maps = self.maps_for("shrink state", dim)?;
        Ok(&maps.shrinking * x)
    }

    /// Maps a common-space covariance to a filter of dimension `dim`.
    pub fn shrink_covariance(&self, p: &DMatrix<f64>, dim: usize) -> Result<DMatrix<f64>> {
        ensure_shape("shrink covariance", p, self.common_dim, self.common_dim)?;
        if dim == self.common_dim {
            return Ok(p.clone());
        }
        let maps = self.maps_for("shrink covariance", dim)?;
        let s = &maps.shrinking;
        Ok(s * p * s.transpose())
    }

    /// Fits a measurement and its covariance to a filter's measurement space.
    ///
    /// Measurements already of size `meas_dim` pass through. Full-state
    /// measurements (size N) are shrunk when `meas_dim` is the native
    /// dimension.
    pub fn shrink_measurement(
        &self,
        z: &DVector<f64>,
        r: Option<&DMatrix<f64>>,
        meas_dim: usize,
    ) -> Result<(DVector<f64>, Option<DMatrix<f64>>)> {
        if z.len() == meas_dim {
            if let Some(r) = r {
                ensure_shape("measurement uncertainty", r, meas_dim, meas_dim)?;
            }
            return Ok((z.clone(), r.cloned()));
        }
        if z.len() != self.common_dim {
            return Err(ImmError::DimensionMismatch {
                context: "measurement".to_string(),
                expected: meas_dim.to_string(),
                actual: z.len().to_string(),
            });
        }
        let z = self.shrink_state(z, meas_dim)?;
        let r = r.map(|r| self.shrink_covariance(r, meas_dim)).transpose()?;
        Ok((z, r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// [x, vx, y, vy] -> [x, vx, ax, y, vy, ay]
    fn cv_to_ca(acc_scale: f64) -> StateSpaceAdapter {
        let mut e = DMatrix::<f64>::zeros(6, 6);
        e[(0, 0)] = 1.0;
        e[(1, 1)] = 1.0;
        e[(3, 2)] = 1.0;
        e[(4, 3)] = 1.0;
        let mut ec = e.clone();
        ec[(2, 4)] = acc_scale;
        ec[(5, 5)] = acc_scale;
        let mut s = DMatrix::<f64>::zeros(4, 6);
        s[(0, 0)] = 1.0;
        s[(1, 1)] = 1.0;
        s[(2, 3)] = 1.0;
        s[(3, 4)] = 1.0;
        StateSpaceAdapter::new(e, Some(ec), s).unwrap()
    }

    #[test]
    fn test_identity_adapter_passes_through() {
        let a = StateSpaceAdapter::identity(3);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_eq!(a.expand_state(&x).unwrap(), x);
        assert_eq!(a.shrink_state(&x, 3).unwrap(), x);
        assert!(a.expand_state(&DVector::zeros(2)).is_err());
        assert!(a.supports(3));
        assert!(!a.supports(2));
    }

    #[test]
    fn test_expand_places_components() {
        let a = cv_to_ca(3.0);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let big = a.expand_state(&x).unwrap();
        assert_eq!(big.as_slice(), &[1.0, 2.0, 0.0, 3.0, 4.0, 0.0]);
        assert_eq!(a.shrink_state(&big, 4).unwrap(), x);
    }

    #[test]
    fn test_expand_covariance_sets_acceleration_variance() {
        let a = cv_to_ca(3.0);
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]));
        let big = a.expand_covariance(&p).unwrap();

        assert_relative_eq!(big[(0, 0)], 1.0);
        assert_relative_eq!(big[(1, 1)], 2.0);
        assert_relative_eq!(big[(2, 2)], 9.0);
        assert_relative_eq!(big[(3, 3)], 3.0);
        assert_relative_eq!(big[(4, 4)], 4.0);
        assert_relative_eq!(big[(5, 5)], 9.0);
        assert_relative_eq!(big, big.transpose());

        assert_relative_eq!(a.shrink_covariance(&big, 4).unwrap(), p);
    }

    #[test]
    fn test_full_state_measurement_is_shrunk() {
        let a = cv_to_ca(1.0);
        let z = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let r = DMatrix::<f64>::identity(6, 6);
        let (zs, rs) = a.shrink_measurement(&z, Some(&r), 4).unwrap();
        assert_eq!(zs.as_slice(), &[1.0, 2.0, 4.0, 5.0]);
        assert_eq!(rs.unwrap(), DMatrix::<f64>::identity(4, 4));

        let pos = DVector::from_vec(vec![1.0, 2.0]);
        let (zp, rp) = a.shrink_measurement(&pos, None, 2).unwrap();
        assert_eq!(zp, pos);
        assert!(rp.is_none());
        assert!(a.shrink_measurement(&pos, None, 3).is_err());
    }

    #[test]
    fn test_invalid_maps_rejected() {
        let e = DMatrix::<f64>::identity(6, 6);
        assert!(StateSpaceAdapter::new(e.clone(), None, DMatrix::zeros(6, 6)).is_err());
        assert!(StateSpaceAdapter::new(e.clone(), None, DMatrix::zeros(4, 5)).is_err());
        assert!(StateSpaceAdapter::new(e, Some(DMatrix::zeros(4, 4)), DMatrix::zeros(4, 6)).is_err());
        assert!(StateSpaceAdapter::new(DMatrix::zeros(6, 4), None, DMatrix::zeros(4, 6)).is_err());
    }
}
