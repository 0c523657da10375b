//! Topology models: an N×N cell matrix plus root and designated leaves.
//!
//! Row `i`, column `j` describes node `j` as seen from node `i`:
//!
//! | value      | meaning                                             |
//! |------------|-----------------------------------------------------|
//! | 0          | no edge                                             |
//! | 1..=49     | `j` is my message-passing child, ordered by value   |
//! | 50..69     | `j` is my shared-memory coordinator                 |
//! | 70..89     | `j` is my shared-memory child at position value-70  |
//! | 99         | `j` is my parent                                    |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CollectiveError, CollectiveResult};
use crate::node::NodeId;

/// Cell marking the parent column.
pub const PARENT: u8 = 99;
/// Largest ordered message-passing child value.
pub const MP_CHILD_MAX: u8 = 49;
/// Shared-memory coordinator range (half open).
pub const SHM_SLAVE_START: u8 = 50;
pub const SHM_SLAVE_MAX: u8 = 69;
/// Shared-memory child range (half open).
pub const SHM_MASTER_START: u8 = 70;
pub const SHM_MASTER_MAX: u8 = 89;

/// Decoded meaning of one matrix cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Empty,
    Parent,
    /// Message-passing child; the raw value orders siblings
    Child(u8),
    ShmCoordinator,
    /// Shared-memory child at this position
    ShmChild(u8),
    Invalid(u8),
}

impl Cell {
    pub fn classify(value: u8) -> Cell {
        match value {
            0 => Cell::Empty,
            PARENT => Cell::Parent,
            1..=MP_CHILD_MAX => Cell::Child(value),
            v if (SHM_SLAVE_START..SHM_SLAVE_MAX).contains(&v) => Cell::ShmCoordinator,
            v if (SHM_MASTER_START..SHM_MASTER_MAX).contains(&v) => {
                Cell::ShmChild(v - SHM_MASTER_START)
            }
            v => Cell::Invalid(v),
        }
    }
}

/// Externally generated tree description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub root: NodeId,
    /// Designated leaves; each must be a structural leaf of the tree
    #[serde(default)]
    pub leaves: Vec<NodeId>,
    pub matrix: Vec<Vec<u8>>,
}

impl Model {
    /// Number of participants.
    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.matrix[row][col]
    }

    pub fn cell(&self, row: usize, col: usize) -> Cell {
        Cell::classify(self.get(row, col))
    }

    /// Balanced binary tree over `n` nodes rooted at 0, last node designated leaf.
    pub fn binary(n: usize) -> CollectiveResult<Self> {
        if n == 0 {
            return Err(CollectiveError::invalid("binary model needs at least one node"));
        }
        let mut matrix = vec![vec![0u8; n]; n];
        for (i, row) in matrix.iter_mut().enumerate() {
            for (k, child) in [2 * i + 1, 2 * i + 2].into_iter().enumerate() {
                if child < n {
                    row[child] = k as u8 + 1;
                }
            }
            if i > 0 {
                row[(i - 1) / 2] = PARENT;
            }
        }
        Ok(Self {
            root: 0,
            leaves: vec![(n - 1) as NodeId],
            matrix,
        })
    }

    /// Check dimensions and id ranges. Structural consistency is checked when
    /// the topology is built.
    pub fn validate_shape(&self) -> CollectiveResult<()> {
        let n = self.len();
        if n == 0 {
            return Err(CollectiveError::invalid("model has no nodes"));
        }
        if let Some((row, r)) = self.matrix.iter().enumerate().find(|(_, r)| r.len() != n) {
            return Err(CollectiveError::invalid(format!(
                "model row {} has {} columns, expected {}",
                row,
                r.len(),
                n
            )));
        }
        if self.root as usize >= n {
            return Err(CollectiveError::invalid(format!(
                "model root {} outside 0..{}",
                self.root, n
            )));
        }
        if let Some(leaf) = self.leaves.iter().find(|&&l| l as usize >= n) {
            return Err(CollectiveError::invalid(format!(
                "model leaf {} outside 0..{}",
                leaf, n
            )));
        }
        Ok(())
    }

    /// Load a model from TOML or YAML (format by extension, else both tried).
    pub fn from_file<P: AsRef<Path>>(path: P) -> CollectiveResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CollectiveError::config(format!("Failed to read model file: {}", e)))?;
        let model: Model = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => toml::from_str::<Model>(&contents)
                .map_err(CollectiveError::from)
                .or_else(|_| serde_yaml::from_str(&contents).map_err(CollectiveError::from))?,
        };
        model.validate_shape()?;
        Ok(model)
    }
}
