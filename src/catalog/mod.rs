//! # Experiment Catalog
//!
//! Owns the catalog aggregate: projects, plates, wells, sites, channels
//! and their per-experiment joins. Lookup-or-create operations are keyed
//! by natural unique names; plate types and wells are pre-seeded reference
//! data and fail strict lookups when absent.
//!
//! This is the only place new Site rows are created. Site creation is
//! idempotent per (experiment, well, site index) so re-running ingestion
//! for the same spec never duplicates rows.

pub mod image_name;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{plate_layout, units};
use crate::error::{PlateflowError, Result};
use crate::grid::{site_to_coords, GridCounts};
use crate::models::{
    Channel, Experiment, ExperimentChannel, NewChannel, NewExperiment, NewExperimentChannel,
    NewImage, Project,
};
use crate::store::CatalogStore;

/// One grid axis of an experiment spec: how many positions and how far
/// apart, in the unit the acquisition software reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    pub count: i32,
    pub delta: f64,
    pub unit: String,
}

/// Grid shape and spacing as uploaded. Spatial axes must be declared in
/// millimeters and the time axis in seconds; anything else is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub x: AxisSpec,
    pub y: AxisSpec,
    pub z: AxisSpec,
    pub t: AxisSpec,
}

/// Per-experiment acquisition settings for one named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub name: String,
    pub exposure_time_ms: f64,
    pub analog_gain: f64,
    pub illumination_strength: f64,
}

/// Everything needed to ingest one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub project_name: String,
    pub experiment_name: String,
    pub description: Option<String>,
    /// Plate type model name; must be pre-seeded reference data.
    pub plate_type: String,
    /// Plate barcode.
    pub plate_name: String,
    pub microscope_name: String,
    pub objective_name: String,
    pub cell_line: Option<String>,
    /// Imaged wells, by name. Must exist for the plate type.
    pub well_list: Vec<String>,
    pub grid: GridSpec,
    /// Channels in imaging order.
    pub channels: Vec<ChannelSettings>,
}

/// One uploaded image: original filename plus where the bytes landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub filename: String,
    pub storage_path: String,
}

/// Catalog service over an injected store handle.
pub struct ExperimentCatalog {
    store: Arc<dyn CatalogStore>,
}

impl ExperimentCatalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Seed static reference data: the standard imaging channels and a
    /// default 96-well plate type with its full well list. Skipped when
    /// the data is already present.
    pub async fn seed_reference_data(&self) -> Result<()> {
        if self.store.find_channel("BF full").await?.is_none() {
            for channel in [
                NewChannel::brightfield("BF full", "full"),
                NewChannel::brightfield("BF right half", "right half"),
                NewChannel::brightfield("BF left half", "left half"),
                NewChannel::fluorescence("Fluorescence 405 nm Ex", 405),
                NewChannel::fluorescence("Fluorescence 488 nm Ex", 488),
                NewChannel::fluorescence("Fluorescence 560 nm Ex", 560),
                NewChannel::fluorescence("Fluorescence 638 nm Ex", 638),
                NewChannel::fluorescence("Fluorescence 730 nm Ex", 730),
            ] {
                self.store.insert_channel(channel).await?;
            }
        }

        if self.store.find_plate_type("96-CO-3603").await?.is_none() {
            let well_names = well_names_for(96)?;
            self.store
                .insert_plate_type("96-CO-3603", "Corning", "Costar", 96, &well_names)
                .await?;
        }

        info!("reference data seeded");
        Ok(())
    }

    /// Strict project lookup.
    pub async fn project_by_name(&self, name: &str) -> Result<Project> {
        self.store.find_project(name).await?.ok_or_else(|| {
            PlateflowError::Validation(format!("project {name:?} not found"))
        })
    }

    /// Strict experiment lookup within a project.
    pub async fn experiment_by_name(&self, project_name: &str, name: &str) -> Result<Experiment> {
        let project = self.project_by_name(project_name).await?;
        self.store
            .find_experiment(project.id, name)
            .await?
            .ok_or_else(|| {
                PlateflowError::Validation(format!(
                    "experiment {name:?} not found in project {project_name:?}"
                ))
            })
    }

    pub async fn list_projects(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_projects()
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect())
    }

    pub async fn list_experiments(&self, project_name: &str) -> Result<Vec<String>> {
        let project = self.project_by_name(project_name).await?;
        Ok(self
            .store
            .list_experiments(project.id)
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    /// Ingest one experiment: validates grid units, normalizes spacing
    /// (z mm to um, t s to h), and persists the experiment together with
    /// one ExperimentWell and one Site per grid position for every listed
    /// well. Idempotent: re-running with the same spec reuses existing
    /// rows instead of duplicating them.
    pub async fn create_experiment(&self, spec: &ExperimentSpec) -> Result<Experiment> {
        validate_unit('x', &spec.grid.x.unit, units::SPATIAL)?;
        validate_unit('y', &spec.grid.y.unit, units::SPATIAL)?;
        validate_unit('z', &spec.grid.z.unit, units::SPATIAL)?;
        validate_unit('t', &spec.grid.t.unit, units::TEMPORAL)?;

        let counts = GridCounts::new(
            i64::from(spec.grid.x.count),
            i64::from(spec.grid.y.count),
            i64::from(spec.grid.z.count),
            i64::from(spec.grid.t.count),
        )?;

        let project = self.store.find_or_create_project(&spec.project_name).await?;

        let plate_type = self
            .store
            .find_plate_type(&spec.plate_type)
            .await?
            .ok_or_else(|| {
                PlateflowError::Validation(format!("plate type {:?} not found", spec.plate_type))
            })?;

        let plate = self
            .store
            .find_or_create_plate(plate_type.id, &spec.plate_name)
            .await?;
        let microscope = self
            .store
            .find_or_create_microscope(&spec.microscope_name)
            .await?;
        let objective = self
            .store
            .find_or_create_objective(&spec.objective_name)
            .await?;

        let experiment = match self
            .store
            .find_experiment(project.id, &spec.experiment_name)
            .await?
        {
            Some(existing) => existing,
            None => {
                self.store
                    .insert_experiment(NewExperiment {
                        project_id: project.id,
                        name: spec.experiment_name.clone(),
                        description: spec.description.clone(),
                        plate_id: plate.id,
                        microscope_id: microscope.id,
                        objective_id: objective.id,
                        count_x: spec.grid.x.count,
                        count_y: spec.grid.y.count,
                        count_z: spec.grid.z.count,
                        count_t: spec.grid.t.count,
                        delta_x_mm: spec.grid.x.delta,
                        delta_y_mm: spec.grid.y.delta,
                        // mm in the metadata file, um in the store
                        delta_z_um: spec.grid.z.delta * 1e3,
                        // seconds in the metadata file, hours in the store
                        delta_t_h: spec.grid.t.delta / 3600.0,
                    })
                    .await?
            }
        };

        let sites_per_well = counts.total_sites()?;
        for well_name in &spec.well_list {
            let well = self
                .store
                .find_well(plate_type.id, well_name)
                .await?
                .ok_or_else(|| {
                    PlateflowError::Validation(format!("well {well_name:?} not found"))
                })?;

            let experiment_well = self
                .store
                .find_or_create_experiment_well(experiment.id, well.id, spec.cell_line.as_deref())
                .await?;

            for site_index in 1..=sites_per_well {
                let coords = site_to_coords(site_index, counts)?;
                self.store
                    .find_or_create_site(
                        experiment_well.id,
                        site_index,
                        coords.x,
                        coords.y,
                        coords.z,
                        coords.t,
                    )
                    .await?;
            }
        }

        if self
            .store
            .list_experiment_channels(experiment.id)
            .await?
            .is_empty()
        {
            for (order_index, settings) in spec.channels.iter().enumerate() {
                let channel = self.channel_by_name(&settings.name).await?;
                self.store
                    .insert_experiment_channel(NewExperimentChannel {
                        experiment_id: experiment.id,
                        channel_id: channel.id,
                        imaging_order_index: order_index as i32,
                        exposure_time_ms: settings.exposure_time_ms,
                        analog_gain: settings.analog_gain,
                        illumination_strength: settings.illumination_strength,
                    })
                    .await?;
            }
        }

        info!(
            experiment = %experiment.name,
            project = %project.name,
            wells = spec.well_list.len(),
            sites_per_well,
            "experiment ingested"
        );
        Ok(experiment)
    }

    /// Record per-image metadata for uploaded files, resolving well and
    /// channel from each parsed filename.
    pub async fn register_images(
        &self,
        experiment: &Experiment,
        images: &[UploadedImage],
    ) -> Result<usize> {
        let plate_type_id = self.plate_type_id_for(experiment).await?;
        let experiment_channels = self.store.list_experiment_channels(experiment.id).await?;

        let mut rows = Vec::with_capacity(images.len());
        for image in images {
            let parsed = image_name::parse(&image.filename)?;

            let well = self
                .store
                .find_well(plate_type_id, &parsed.well)
                .await?
                .ok_or_else(|| {
                    PlateflowError::Validation(format!("well {:?} not found", parsed.well))
                })?;

            let channel = self.channel_by_name(&parsed.channel).await?;
            let experiment_channel = experiment_channels
                .iter()
                .find(|ec| ec.channel_id == channel.id)
                .ok_or_else(|| {
                    PlateflowError::Validation(format!(
                        "channel {:?} not configured for experiment {:?}",
                        parsed.channel, experiment.name
                    ))
                })?;

            rows.push(NewImage {
                plate_id: experiment.plate_id,
                storage_path: image.storage_path.clone(),
                well_id: well.id,
                site_x: parsed.site_x,
                site_y: parsed.site_y,
                site_z: parsed.site_z,
                // the time index comes from the acquisition directory
                // layout, which uploads flatten; single-timepoint default
                site_t: 1,
                experiment_channel_id: experiment_channel.id,
                coord_x_mm: None,
                coord_y_mm: None,
                coord_z_um: None,
                coord_t: None,
            });
        }

        let inserted = self.store.insert_images(rows).await?;
        debug!(count = inserted.len(), "image metadata recorded");
        Ok(inserted.len())
    }

    async fn channel_by_name(&self, name: &str) -> Result<Channel> {
        self.store.find_channel(name).await?.ok_or_else(|| {
            PlateflowError::Validation(format!("channel {name:?} not found"))
        })
    }

    async fn plate_type_id_for(&self, experiment: &Experiment) -> Result<i64> {
        // The experiment's wells all belong to one plate type; any
        // experiment well resolves it.
        let wells = self.store.list_experiment_wells(experiment.id).await?;
        wells
            .first()
            .map(|(_, well)| well.plate_type_id)
            .ok_or_else(|| {
                PlateflowError::Validation(format!(
                    "experiment {:?} has no wells",
                    experiment.name
                ))
            })
    }

    /// Ordered channel settings for an experiment.
    pub async fn experiment_channels(
        &self,
        experiment_id: i64,
    ) -> Result<Vec<ExperimentChannel>> {
        self.store.list_experiment_channels(experiment_id).await
    }
}

fn validate_unit(axis: char, unit: &str, expected: &'static str) -> Result<()> {
    if unit == expected {
        Ok(())
    } else {
        Err(PlateflowError::UnsupportedUnit {
            axis,
            unit: unit.to_string(),
            expected,
        })
    }
}

/// Well names for a supported plate layout, row-major: "A01".."H12" for
/// 96 wells, "A01".."P24" for 384.
pub fn well_names_for(num_wells: u32) -> Result<Vec<String>> {
    let (rows, cols) = plate_layout::for_well_count(num_wells).ok_or_else(|| {
        PlateflowError::Validation(format!("unsupported well count: {num_wells}"))
    })?;

    let mut names = Vec::with_capacity((rows * cols) as usize);
    for row in 0..rows {
        let letter = char::from(b'A' + row as u8);
        for col in 1..=cols {
            names.push(format!("{letter}{col:02}"));
        }
    }
    Ok(names)
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Spec for a one-well, one-site experiment; assumes seeded reference
    /// data.
    pub fn small_experiment_spec() -> ExperimentSpec {
        experiment_spec(&["B03"], (1, 1, 1, 1))
    }

    pub fn experiment_spec(wells: &[&str], counts: (i32, i32, i32, i32)) -> ExperimentSpec {
        let axis = |count, delta| AxisSpec {
            count,
            delta,
            unit: units::SPATIAL.to_string(),
        };
        ExperimentSpec {
            project_name: "proj".to_string(),
            experiment_name: "exp".to_string(),
            description: None,
            plate_type: "96-CO-3603".to_string(),
            plate_name: "plate-1".to_string(),
            microscope_name: "squid-1".to_string(),
            objective_name: "20x".to_string(),
            cell_line: Some("U2OS".to_string()),
            well_list: wells.iter().map(|w| w.to_string()).collect(),
            grid: GridSpec {
                x: axis(counts.0, 0.9),
                y: axis(counts.1, 0.9),
                z: axis(counts.2, 0.0015),
                t: AxisSpec {
                    count: counts.3,
                    delta: 0.0,
                    unit: units::TEMPORAL.to_string(),
                },
            },
            channels: vec![ChannelSettings {
                name: "BF full".to_string(),
                exposure_time_ms: 20.0,
                analog_gain: 0.0,
                illumination_strength: 5.0,
            }],
        }
    }
}
