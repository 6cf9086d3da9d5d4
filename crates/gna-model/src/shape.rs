// SPDX-License-Identifier: AGPL-3.0-only

//! Tensor shapes

use std::fmt;

/// Maximum tensor rank
pub const MAX_RANK: usize = 8;

/// Tensor dimensions, outermost first
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<u32>,
}

impl Shape {
    /// Create a shape from dimensions
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    /// Dimensions
    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    /// Number of dimensions
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension `index`, or 0 when out of range
    pub fn dim(&self, index: usize) -> u32 {
        self.dims.get(index).copied().unwrap_or(0)
    }

    /// Product of all dimensions; 0 for an empty shape
    pub fn element_count(&self) -> u64 {
        if self.dims.is_empty() {
            return 0;
        }
        self.dims.iter().map(|&d| u64::from(d)).product()
    }

    /// True when every dimension is non-zero and the rank is within bounds
    pub fn is_valid(&self) -> bool {
        !self.dims.is_empty() && self.dims.len() <= MAX_RANK && self.dims.iter().all(|&d| d > 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[u32]> for Shape {
    fn from(dims: &[u32]) -> Self {
        Self::new(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count() {
        assert_eq!(Shape::new(&[2, 3, 4]).element_count(), 24);
        assert_eq!(Shape::default().element_count(), 0);
    }

    #[test]
    fn test_validity() {
        assert!(Shape::new(&[1, 8]).is_valid());
        assert!(!Shape::new(&[1, 0]).is_valid());
        assert!(!Shape::new(&[1; 9]).is_valid());
        assert!(!Shape::default().is_valid());
    }

    #[test]
    fn test_display() {
        assert_eq!(Shape::new(&[4, 16]).to_string(), "[4, 16]");
    }
}
