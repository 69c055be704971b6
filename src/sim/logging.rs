use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DMatrix;

use crate::errors::SimError;

/// A shared, append-capable sequence of floats.
///
/// This is the container used at the host boundary for log sinks, the state
/// and bound-variable outputs. Handles are cheap clones of the same
/// underlying storage, so the host keeps one handle and reads the results
/// after the simulation has written through its own.
#[derive(Clone, Debug, Default)]
pub struct LogBuffer {
    inner: Rc<RefCell<Vec<f64>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(values)),
        }
    }

    pub fn append(&self, value: f64) -> Result<(), SimError> {
        self.inner
            .try_borrow_mut()
            .map_err(|e| SimError::LogAppendFailed(e.to_string()))?
            .push(value);
        Ok(())
    }

    /// Replaces the contents, used for final-state and bound-variable slots.
    pub fn assign(&self, values: &[f64]) {
        let mut inner = self.inner.borrow_mut();
        inner.clear();
        inner.extend_from_slice(values);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<f64> {
        self.inner.borrow().clone()
    }
}

/// A shared sequence of sensitivity matrix snapshots
/// (`ns_dependents` rows by `ns_independents` columns each).
#[derive(Clone, Debug, Default)]
pub struct SensBuffer {
    inner: Rc<RefCell<Vec<DMatrix<f64>>>>,
}

impl SensBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, matrix: DMatrix<f64>) -> Result<(), SimError> {
        self.inner
            .try_borrow_mut()
            .map_err(|e| SimError::SensitivityAppendFailed(e.to_string()))?
            .push(matrix);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matrices(&self) -> Vec<DMatrix<f64>> {
        self.inner.borrow().clone()
    }
}

/// One detected root crossing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RootCrossing {
    pub time: f64,
    /// `+1` for an upward crossing, `-1` for a downward crossing.
    pub direction: i8,
}

/// A shared sequence of root crossings.
#[derive(Clone, Debug, Default)]
pub struct RootBuffer {
    inner: Rc<RefCell<Vec<RootCrossing>>>,
}

impl RootBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, crossing: RootCrossing) -> Result<(), SimError> {
        self.inner
            .try_borrow_mut()
            .map_err(|e| SimError::LogAppendFailed(e.to_string()))?
            .push(crossing);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn crossings(&self) -> Vec<RootCrossing> {
        self.inner.borrow().clone()
    }
}

/// A shared row-list of floats, used for the state sensitivity matrix passed
/// into `init` and written back on completion.
#[derive(Clone, Debug, Default)]
pub struct MatrixBuffer {
    inner: Rc<RefCell<Vec<Vec<f64>>>>,
}

impl MatrixBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(rows)),
        }
    }

    pub fn assign(&self, rows: &[Vec<f64>]) {
        let mut inner = self.inner.borrow_mut();
        inner.clear();
        inner.extend_from_slice(rows);
    }

    pub fn rows(&self) -> Vec<Vec<f64>> {
        self.inner.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_shares_storage() {
        let host = LogBuffer::new();
        let driver = host.clone();
        driver.append(1.0).unwrap();
        driver.append(2.0).unwrap();
        assert_eq!(host.values(), vec![1.0, 2.0]);
        host.assign(&[5.0]);
        assert_eq!(driver.values(), vec![5.0]);
    }

    #[test]
    fn test_matrix_buffer_round_trip() {
        let buffer = MatrixBuffer::from_rows(vec![vec![1.0, 2.0]]);
        assert_eq!(buffer.rows(), vec![vec![1.0, 2.0]]);
        buffer.assign(&[vec![3.0], vec![4.0]]);
        assert_eq!(buffer.rows().len(), 2);
    }
}
