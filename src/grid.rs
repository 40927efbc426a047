//! # Grid Addressing
//!
//! Pure conversions between a 1-indexed linear site index and the
//! 0-indexed (x, y, z, t) position of that site within a well's imaging
//! grid. The x axis varies fastest, then y, then z, then t, matching the
//! acquisition order of the microscope.

use serde::{Deserialize, Serialize};

use crate::error::{PlateflowError, Result};

/// Number of imaged positions along each grid axis. All counts are at
/// least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCounts {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub t: i64,
}

/// 0-indexed grid position of one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteCoords {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub t: i64,
}

impl GridCounts {
    pub fn new(x: i64, y: i64, z: i64, t: i64) -> Result<Self> {
        if x < 1 || y < 1 || z < 1 || t < 1 {
            return Err(PlateflowError::Validation(format!(
                "grid counts must all be >= 1, got ({x}, {y}, {z}, {t})"
            )));
        }
        let counts = Self { x, y, z, t };
        counts.total_sites()?;
        Ok(counts)
    }

    /// Total sites per well in this grid. Fails when the product does not
    /// fit an `i64` (possible for counts deserialized from untrusted rows
    /// rather than built through [`GridCounts::new`]).
    pub fn total_sites(&self) -> Result<i64> {
        self.x
            .checked_mul(self.y)
            .and_then(|p| p.checked_mul(self.z))
            .and_then(|p| p.checked_mul(self.t))
            .ok_or_else(|| {
                PlateflowError::Validation(format!(
                    "grid ({}, {}, {}, {}) has more sites than addressable",
                    self.x, self.y, self.z, self.t
                ))
            })
    }
}

/// Decompose a 1-indexed site index into its grid position.
pub fn site_to_coords(site_index: i64, counts: GridCounts) -> Result<SiteCoords> {
    let max = counts.total_sites()?;
    if site_index < 1 || site_index > max {
        return Err(PlateflowError::SiteOutOfRange { site_index, max });
    }

    let i = site_index - 1;
    Ok(SiteCoords {
        x: i % counts.x,
        y: (i / counts.x) % counts.y,
        z: (i / (counts.x * counts.y)) % counts.z,
        t: (i / (counts.x * counts.y * counts.z)) % counts.t,
    })
}

/// Reconstruct the 1-indexed site index from a grid position. Inverse of
/// [`site_to_coords`] for every valid index.
pub fn coords_to_site(coords: SiteCoords, counts: GridCounts) -> Result<i64> {
    counts.total_sites()?;
    let SiteCoords { x, y, z, t } = coords;
    if x < 0
        || x >= counts.x
        || y < 0
        || y >= counts.y
        || z < 0
        || z >= counts.z
        || t < 0
        || t >= counts.t
    {
        return Err(PlateflowError::Validation(format!(
            "coords ({x}, {y}, {z}, {t}) outside grid {counts:?}"
        )));
    }

    let i = x + counts.x * (y + counts.y * (z + counts.z * t));
    Ok(i + 1)
}
