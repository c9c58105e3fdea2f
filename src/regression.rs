//! Incremental regularized linear regression.
//!
//! The regressor keeps the sufficient statistics `XᵀX` and `XᵀY`, so an
//! increment with new rows yields exactly the solution a single fit on all
//! rows seen so far would give.

use nalgebra::DMatrix;

use crate::error::{Error, Result};

const SVD_EPS: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct IncrementalRidge {
    alpha: f64,
    bias: bool,
    xtx: Option<DMatrix<f64>>,
    xty: Option<DMatrix<f64>>,
    weights: Option<DMatrix<f64>>,
    n_samples: usize,
}

impl IncrementalRidge {
    pub fn new(alpha: f64, bias: bool) -> Self {
        Self {
            alpha,
            bias,
            xtx: None,
            xty: None,
            weights: None,
            n_samples: 0,
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Rows seen since the last [`train`](Self::train).
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Learned weights, `(n_features [+ 1]) x n_targets`; the bias row is last.
    pub fn weights(&self) -> Option<&DMatrix<f64>> {
        self.weights.as_ref()
    }

    fn design(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        if self.bias {
            x.clone().insert_column(x.ncols(), 1.0)
        } else {
            x.clone()
        }
    }

    /// Discard everything learned and fit on `x`, `y`.
    pub fn train(&mut self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<()> {
        self.xtx = None;
        self.xty = None;
        self.weights = None;
        self.n_samples = 0;
        self.increment(x, y)
    }

    /// Fold new rows into the statistics and re-solve.
    pub fn increment(&mut self, x: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<()> {
        if x.nrows() != y.nrows() {
            return Err(Error::Regression(format!(
                "{} feature rows but {} target rows",
                x.nrows(),
                y.nrows()
            )));
        }
        let design = self.design(x);
        let xtx = design.transpose() * &design;
        let xty = design.transpose() * y;

        let (xtx, xty) = match (self.xtx.take(), self.xty.take()) {
            (Some(acc_xtx), Some(acc_xty)) => {
                if acc_xtx.shape() != xtx.shape() || acc_xty.shape() != xty.shape() {
                    let fitted = acc_xty.shape();
                    self.xtx = Some(acc_xtx);
                    self.xty = Some(acc_xty);
                    return Err(Error::Regression(format!(
                        "increment dimensions {:?} do not match fitted {:?}",
                        xty.shape(),
                        fitted
                    )));
                }
                (acc_xtx + xtx, acc_xty + xty)
            }
            _ => (xtx, xty),
        };
        self.xtx = Some(xtx);
        self.xty = Some(xty);
        self.n_samples += x.nrows();
        self.solve()
    }

    fn solve(&mut self) -> Result<()> {
        let (Some(xtx), Some(xty)) = (&self.xtx, &self.xty) else {
            return Err(Error::NotTrained);
        };
        let mut lhs = xtx.clone();
        for i in 0..lhs.nrows() {
            lhs[(i, i)] += self.alpha;
        }

        let weights = match lhs.clone().cholesky() {
            Some(chol) => chol.solve(xty),
            // Rank deficient: fall back to the minimum-norm solution.
            None => lhs
                .svd(true, true)
                .solve(xty, SVD_EPS)
                .map_err(|e| Error::Regression(e.to_string()))?,
        };
        self.weights = Some(weights);
        Ok(())
    }

    pub fn predict(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        let weights = self.weights.as_ref().ok_or(Error::NotTrained)?;
        let design = self.design(x);
        if design.ncols() != weights.nrows() {
            return Err(Error::Regression(format!(
                "expected {} features, got {}",
                weights.nrows(),
                design.ncols()
            )));
        }
        Ok(design * weights)
    }
}
