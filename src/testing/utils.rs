use nalgebra_sparse::CscMatrix;
use num_traits::ToPrimitive;
use single_utilities::traits::FloatOpsTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Neither,
    First,
    Second,
}

/// Assignment of matrix rows (cells) to the two groups under comparison.
#[derive(Debug, Clone)]
pub struct GroupMembership {
    side: Vec<Side>,
    n1: usize,
    n2: usize,
}

impl GroupMembership {
    /// Groups must be non-empty, in range and disjoint. Duplicated indices count once.
    pub fn new(n_rows: usize, group1: &[usize], group2: &[usize]) -> anyhow::Result<Self> {
        if group1.is_empty() || group2.is_empty() {
            return Err(anyhow::anyhow!("Group indices cannot be empty"));
        }
        let mut side = vec![Side::Neither; n_rows];
        let (mut n1, mut n2) = (0, 0);
        for &i in group1 {
            let slot = side
                .get_mut(i)
                .ok_or_else(|| anyhow::anyhow!("Row index {i} out of bounds ({n_rows} rows)"))?;
            if *slot == Side::Neither {
                *slot = Side::First;
                n1 += 1;
            }
        }
        for &i in group2 {
            let slot = side
                .get_mut(i)
                .ok_or_else(|| anyhow::anyhow!("Row index {i} out of bounds ({n_rows} rows)"))?;
            match *slot {
                Side::First => return Err(anyhow::anyhow!("Row {i} is in both groups")),
                Side::Neither => {
                    *slot = Side::Second;
                    n2 += 1;
                }
                Side::Second => {}
            }
        }
        Ok(Self { side, n1, n2 })
    }

    pub fn n1(&self) -> usize {
        self.n1
    }

    pub fn n2(&self) -> usize {
        self.n2
    }

    /// Nonzero values of column `col` split by group. Explicitly stored zeros are treated
    /// like implicit ones.
    pub fn split_column<T>(&self, matrix: &CscMatrix<T>, col: usize) -> ColumnSplit
    where
        T: FloatOpsTS,
    {
        let column = matrix.col(col);
        let mut split = ColumnSplit {
            x: Vec::new(),
            y: Vec::new(),
            n1: self.n1,
            n2: self.n2,
        };
        for (&row, &value) in column.row_indices().iter().zip(column.values()) {
            let v = ToPrimitive::to_f64(&value).unwrap_or(0.0);
            if v == 0.0 {
                continue;
            }
            match self.side[row] {
                Side::First => split.x.push(v),
                Side::Second => split.y.push(v),
                Side::Neither => {}
            }
        }
        split
    }
}

/// One gene's nonzero values in each group; the remaining cells of each group are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSplit {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub n1: usize,
    pub n2: usize,
}

impl ColumnSplit {
    /// Build from dense samples.
    pub fn from_dense(x: &[f64], y: &[f64]) -> Self {
        Self {
            x: x.iter().copied().filter(|&v| v != 0.0).collect(),
            y: y.iter().copied().filter(|&v| v != 0.0).collect(),
            n1: x.len(),
            n2: y.len(),
        }
    }

    pub fn zeros_x(&self) -> usize {
        self.n1 - self.x.len()
    }

    pub fn zeros_y(&self) -> usize {
        self.n2 - self.y.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::{CooMatrix, CscMatrix};

    #[test]
    fn split_by_membership() {
        let mut coo = CooMatrix::new(4, 1);
        coo.push(0, 0, 2.0);
        coo.push(2, 0, 3.0);
        coo.push(3, 0, 0.0);
        let m = CscMatrix::from(&coo);
        let groups = GroupMembership::new(4, &[0, 1], &[2, 3]).unwrap();
        let split = groups.split_column(&m, 0);
        assert_eq!(split.x, vec![2.0]);
        assert_eq!(split.y, vec![3.0]);
        assert_eq!((split.zeros_x(), split.zeros_y()), (1, 1));
    }

    #[test]
    fn overlapping_groups_are_rejected() {
        assert!(GroupMembership::new(3, &[0, 1], &[1, 2]).is_err());
        assert!(GroupMembership::new(3, &[0], &[]).is_err());
        assert!(GroupMembership::new(3, &[0], &[5]).is_err());
    }
}
