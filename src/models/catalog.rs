//! Catalog entities: reference data (plate types, wells, channels,
//! microscopes, objectives) and per-experiment rows (experiment, wells,
//! sites, channel settings, images).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::grid::{GridCounts, SiteCoords};

/// A project groups experiments. Names are unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
}

/// A plate model (manufacturer, brand, well count). Fixes the well layout:
/// 96-well plates are 8x12, 384-well plates are 16x24.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PlateType {
    pub id: i64,
    pub model_name: String,
    pub manufacturer: String,
    pub brand: String,
    pub num_wells: i32,
}

/// A physical plate, identified by barcode, of one plate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Plate {
    pub id: i64,
    pub plate_type_id: i64,
    pub barcode: String,
}

/// One well position on a plate type, named `<row letter><two-digit
/// column>` (e.g. "B03").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Well {
    pub id: i64,
    pub plate_type_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Microscope {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Objective {
    pub id: i64,
    pub name: String,
}

/// An imaging modality: a brightfield variant or a fluorescence
/// excitation wavelength. The human-readable name is the lookup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub is_fluorescence: bool,
    pub fluorescence_wavelength_nm: Option<i32>,
    pub is_brightfield: bool,
    pub brightfield_type: Option<String>,
}

/// One imaging experiment: a plate imaged on a microscope/objective over a
/// per-well grid of (x, y, z, t) positions.
///
/// Spacing units are normalized at ingestion: x/y/z arrive in millimeters
/// (z stored as micrometers), t arrives in seconds (stored as hours).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Experiment {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub plate_id: i64,
    pub microscope_id: i64,
    pub objective_id: i64,
    pub count_x: i32,
    pub count_y: i32,
    pub count_z: i32,
    pub count_t: i32,
    pub delta_x_mm: f64,
    pub delta_y_mm: f64,
    pub delta_z_um: f64,
    pub delta_t_h: f64,
}

impl Experiment {
    pub fn grid_counts(&self) -> GridCounts {
        GridCounts {
            x: i64::from(self.count_x),
            y: i64::from(self.count_y),
            z: i64::from(self.count_z),
            t: i64::from(self.count_t),
        }
    }

    /// Sites per well in this experiment's grid.
    pub fn sites_per_well(&self) -> crate::error::Result<i64> {
        self.grid_counts().total_sites()
    }
}

/// Join of experiment and well, optionally annotated with the cell line
/// seeded in that well. The same well may appear more than once per
/// experiment (discouraged, not forbidden).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ExperimentWell {
    pub id: i64,
    pub experiment_id: i64,
    pub well_id: i64,
    pub cell_line: Option<String>,
}

/// One imaged field of view within an experiment well: a 1-indexed linear
/// site index plus its derived grid position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Site {
    pub id: i64,
    pub experiment_well_id: i64,
    pub site_index: i64,
    pub site_x: i64,
    pub site_y: i64,
    pub site_z: i64,
    pub site_t: i64,
}

impl Site {
    pub fn coords(&self) -> SiteCoords {
        SiteCoords {
            x: self.site_x,
            y: self.site_y,
            z: self.site_z,
            t: self.site_t,
        }
    }
}

/// Per-experiment settings for one imaging channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ExperimentChannel {
    pub id: i64,
    pub experiment_id: i64,
    pub channel_id: i64,
    pub imaging_order_index: i32,
    pub exposure_time_ms: f64,
    pub analog_gain: f64,
    pub illumination_strength: f64,
}

/// One captured image: storage location plus full grid address and
/// optional physical stage coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: i64,
    pub plate_id: i64,
    pub storage_path: String,
    pub well_id: i64,
    pub site_x: i64,
    pub site_y: i64,
    pub site_z: i64,
    pub site_t: i64,
    pub experiment_channel_id: i64,
    pub coord_x_mm: Option<f64>,
    pub coord_y_mm: Option<f64>,
    pub coord_z_um: Option<f64>,
    pub coord_t: Option<NaiveDateTime>,
}

/// Channel row before insertion; used when seeding reference data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub is_fluorescence: bool,
    pub fluorescence_wavelength_nm: Option<i32>,
    pub is_brightfield: bool,
    pub brightfield_type: Option<String>,
}

impl NewChannel {
    pub fn brightfield(name: &str, variant: &str) -> Self {
        Self {
            name: name.to_string(),
            is_fluorescence: false,
            fluorescence_wavelength_nm: None,
            is_brightfield: true,
            brightfield_type: Some(variant.to_string()),
        }
    }

    pub fn fluorescence(name: &str, wavelength_nm: i32) -> Self {
        Self {
            name: name.to_string(),
            is_fluorescence: true,
            fluorescence_wavelength_nm: Some(wavelength_nm),
            is_brightfield: false,
            brightfield_type: None,
        }
    }
}

/// Experiment row before insertion, with spacing already normalized to
/// storage units (z in micrometers, t in hours).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperiment {
    pub project_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub plate_id: i64,
    pub microscope_id: i64,
    pub objective_id: i64,
    pub count_x: i32,
    pub count_y: i32,
    pub count_z: i32,
    pub count_t: i32,
    pub delta_x_mm: f64,
    pub delta_y_mm: f64,
    pub delta_z_um: f64,
    pub delta_t_h: f64,
}

/// Experiment channel settings before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExperimentChannel {
    pub experiment_id: i64,
    pub channel_id: i64,
    pub imaging_order_index: i32,
    pub exposure_time_ms: f64,
    pub analog_gain: f64,
    pub illumination_strength: f64,
}

/// Image row before insertion (no generated id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImage {
    pub plate_id: i64,
    pub storage_path: String,
    pub well_id: i64,
    pub site_x: i64,
    pub site_y: i64,
    pub site_z: i64,
    pub site_t: i64,
    pub experiment_channel_id: i64,
    pub coord_x_mm: Option<f64>,
    pub coord_y_mm: Option<f64>,
    pub coord_z_um: Option<f64>,
    pub coord_t: Option<NaiveDateTime>,
}
