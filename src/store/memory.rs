//! In-memory store backing tests and local development. One mutex over
//! the whole dataset; the lock is held across compound operations (e.g.
//! allocate-then-insert), which gives this backend stronger serialization
//! than the row-level atomicity the design requires.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;

use super::{BatchStore, CatalogStore, FileRef};
use crate::error::{PlateflowError, Result};
use crate::models::{
    BatchSite, Channel, Experiment, ExperimentChannel, ExperimentWell, Image, Microscope,
    NewChannel, NewExperiment, NewExperimentChannel, NewImage, NewProcessingBatch, Objective,
    Plate, PlateType, ProcessingBatch, Project, ResultFile, Site, Well,
};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    projects: Vec<Project>,
    plate_types: Vec<PlateType>,
    wells: Vec<Well>,
    plates: Vec<Plate>,
    microscopes: Vec<Microscope>,
    objectives: Vec<Objective>,
    channels: Vec<Channel>,
    experiments: Vec<Experiment>,
    experiment_wells: Vec<ExperimentWell>,
    sites: Vec<Site>,
    experiment_channels: Vec<ExperimentChannel>,
    images: Vec<Image>,
    batches: Vec<ProcessingBatch>,
    batch_sites: Vec<BatchSite>,
    result_files: Vec<ResultFile>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory implementation of both store traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let t = self.tables.lock();
        Ok(t.projects.iter().find(|p| p.name == name).cloned())
    }

    async fn find_or_create_project(&self, name: &str) -> Result<Project> {
        let mut t = self.tables.lock();
        if let Some(p) = t.projects.iter().find(|p| p.name == name) {
            return Ok(p.clone());
        }
        let id = t.allocate_id();
        let project = Project {
            id,
            name: name.to_string(),
        };
        t.projects.push(project.clone());
        Ok(project)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.tables.lock().projects.clone())
    }

    async fn find_plate_type(&self, model_name: &str) -> Result<Option<PlateType>> {
        let t = self.tables.lock();
        Ok(t.plate_types
            .iter()
            .find(|pt| pt.model_name == model_name)
            .cloned())
    }

    async fn insert_plate_type(
        &self,
        model_name: &str,
        manufacturer: &str,
        brand: &str,
        num_wells: i32,
        well_names: &[String],
    ) -> Result<PlateType> {
        let mut t = self.tables.lock();
        let id = t.allocate_id();
        let plate_type = PlateType {
            id,
            model_name: model_name.to_string(),
            manufacturer: manufacturer.to_string(),
            brand: brand.to_string(),
            num_wells,
        };
        t.plate_types.push(plate_type.clone());
        for name in well_names {
            let well_id = t.allocate_id();
            t.wells.push(Well {
                id: well_id,
                plate_type_id: id,
                name: name.clone(),
            });
        }
        Ok(plate_type)
    }

    async fn find_well(&self, plate_type_id: i64, name: &str) -> Result<Option<Well>> {
        let t = self.tables.lock();
        Ok(t.wells
            .iter()
            .find(|w| w.plate_type_id == plate_type_id && w.name == name)
            .cloned())
    }

    async fn find_or_create_plate(&self, plate_type_id: i64, barcode: &str) -> Result<Plate> {
        let mut t = self.tables.lock();
        if let Some(p) = t.plates.iter().find(|p| p.barcode == barcode) {
            return Ok(p.clone());
        }
        let id = t.allocate_id();
        let plate = Plate {
            id,
            plate_type_id,
            barcode: barcode.to_string(),
        };
        t.plates.push(plate.clone());
        Ok(plate)
    }

    async fn find_or_create_microscope(&self, name: &str) -> Result<Microscope> {
        let mut t = self.tables.lock();
        if let Some(m) = t.microscopes.iter().find(|m| m.name == name) {
            return Ok(m.clone());
        }
        let id = t.allocate_id();
        let microscope = Microscope {
            id,
            name: name.to_string(),
        };
        t.microscopes.push(microscope.clone());
        Ok(microscope)
    }

    async fn find_or_create_objective(&self, name: &str) -> Result<Objective> {
        let mut t = self.tables.lock();
        if let Some(o) = t.objectives.iter().find(|o| o.name == name) {
            return Ok(o.clone());
        }
        let id = t.allocate_id();
        let objective = Objective {
            id,
            name: name.to_string(),
        };
        t.objectives.push(objective.clone());
        Ok(objective)
    }

    async fn find_channel(&self, name: &str) -> Result<Option<Channel>> {
        let t = self.tables.lock();
        Ok(t.channels.iter().find(|c| c.name == name).cloned())
    }

    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel> {
        let mut t = self.tables.lock();
        let id = t.allocate_id();
        let channel = Channel {
            id,
            name: channel.name,
            is_fluorescence: channel.is_fluorescence,
            fluorescence_wavelength_nm: channel.fluorescence_wavelength_nm,
            is_brightfield: channel.is_brightfield,
            brightfield_type: channel.brightfield_type,
        };
        t.channels.push(channel.clone());
        Ok(channel)
    }

    async fn find_experiment(&self, project_id: i64, name: &str) -> Result<Option<Experiment>> {
        let t = self.tables.lock();
        Ok(t.experiments
            .iter()
            .find(|e| e.project_id == project_id && e.name == name)
            .cloned())
    }

    async fn insert_experiment(&self, experiment: NewExperiment) -> Result<Experiment> {
        let mut t = self.tables.lock();
        let id = t.allocate_id();
        let experiment = Experiment {
            id,
            project_id: experiment.project_id,
            name: experiment.name,
            description: experiment.description,
            plate_id: experiment.plate_id,
            microscope_id: experiment.microscope_id,
            objective_id: experiment.objective_id,
            count_x: experiment.count_x,
            count_y: experiment.count_y,
            count_z: experiment.count_z,
            count_t: experiment.count_t,
            delta_x_mm: experiment.delta_x_mm,
            delta_y_mm: experiment.delta_y_mm,
            delta_z_um: experiment.delta_z_um,
            delta_t_h: experiment.delta_t_h,
        };
        t.experiments.push(experiment.clone());
        Ok(experiment)
    }

    async fn list_experiments(&self, project_id: i64) -> Result<Vec<Experiment>> {
        let t = self.tables.lock();
        Ok(t.experiments
            .iter()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn find_or_create_experiment_well(
        &self,
        experiment_id: i64,
        well_id: i64,
        cell_line: Option<&str>,
    ) -> Result<ExperimentWell> {
        let mut t = self.tables.lock();
        if let Some(ew) = t
            .experiment_wells
            .iter()
            .find(|ew| {
                ew.experiment_id == experiment_id
                    && ew.well_id == well_id
                    && ew.cell_line.as_deref() == cell_line
            })
        {
            return Ok(ew.clone());
        }
        let id = t.allocate_id();
        let experiment_well = ExperimentWell {
            id,
            experiment_id,
            well_id,
            cell_line: cell_line.map(str::to_string),
        };
        t.experiment_wells.push(experiment_well.clone());
        Ok(experiment_well)
    }

    async fn list_experiment_wells(
        &self,
        experiment_id: i64,
    ) -> Result<Vec<(ExperimentWell, Well)>> {
        let t = self.tables.lock();
        let mut out = Vec::new();
        for ew in t
            .experiment_wells
            .iter()
            .filter(|ew| ew.experiment_id == experiment_id)
        {
            let well = t
                .wells
                .iter()
                .find(|w| w.id == ew.well_id)
                .cloned()
                .ok_or_else(|| {
                    PlateflowError::store(
                        "list_experiment_wells",
                        format!("dangling well id {}", ew.well_id),
                    )
                })?;
            out.push((ew.clone(), well));
        }
        Ok(out)
    }

    async fn find_or_create_site(
        &self,
        experiment_well_id: i64,
        site_index: i64,
        site_x: i64,
        site_y: i64,
        site_z: i64,
        site_t: i64,
    ) -> Result<Site> {
        let mut t = self.tables.lock();
        if let Some(s) = t
            .sites
            .iter()
            .find(|s| s.experiment_well_id == experiment_well_id && s.site_index == site_index)
        {
            return Ok(s.clone());
        }
        let id = t.allocate_id();
        let site = Site {
            id,
            experiment_well_id,
            site_index,
            site_x,
            site_y,
            site_z,
            site_t,
        };
        t.sites.push(site.clone());
        Ok(site)
    }

    async fn list_sites(&self, experiment_id: i64) -> Result<Vec<(Site, String)>> {
        let t = self.tables.lock();
        let mut out = Vec::new();
        for ew in t
            .experiment_wells
            .iter()
            .filter(|ew| ew.experiment_id == experiment_id)
        {
            let well_name = t
                .wells
                .iter()
                .find(|w| w.id == ew.well_id)
                .map(|w| w.name.clone())
                .ok_or_else(|| {
                    PlateflowError::store(
                        "list_sites",
                        format!("dangling well id {}", ew.well_id),
                    )
                })?;
            for site in t.sites.iter().filter(|s| s.experiment_well_id == ew.id) {
                out.push((site.clone(), well_name.clone()));
            }
        }
        Ok(out)
    }

    async fn find_site(
        &self,
        experiment_id: i64,
        well_name: &str,
        site_index: i64,
    ) -> Result<Option<Site>> {
        let t = self.tables.lock();
        for ew in t
            .experiment_wells
            .iter()
            .filter(|ew| ew.experiment_id == experiment_id)
        {
            let matches_name = t
                .wells
                .iter()
                .any(|w| w.id == ew.well_id && w.name == well_name);
            if !matches_name {
                continue;
            }
            if let Some(site) = t
                .sites
                .iter()
                .find(|s| s.experiment_well_id == ew.id && s.site_index == site_index)
            {
                return Ok(Some(site.clone()));
            }
        }
        Ok(None)
    }

    async fn insert_experiment_channel(
        &self,
        channel: NewExperimentChannel,
    ) -> Result<ExperimentChannel> {
        let mut t = self.tables.lock();
        let id = t.allocate_id();
        let experiment_channel = ExperimentChannel {
            id,
            experiment_id: channel.experiment_id,
            channel_id: channel.channel_id,
            imaging_order_index: channel.imaging_order_index,
            exposure_time_ms: channel.exposure_time_ms,
            analog_gain: channel.analog_gain,
            illumination_strength: channel.illumination_strength,
        };
        t.experiment_channels.push(experiment_channel.clone());
        Ok(experiment_channel)
    }

    async fn list_experiment_channels(
        &self,
        experiment_id: i64,
    ) -> Result<Vec<ExperimentChannel>> {
        let t = self.tables.lock();
        Ok(t.experiment_channels
            .iter()
            .filter(|c| c.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    async fn insert_images(&self, images: Vec<NewImage>) -> Result<Vec<Image>> {
        let mut t = self.tables.lock();
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let id = t.allocate_id();
            let image = Image {
                id,
                plate_id: image.plate_id,
                storage_path: image.storage_path,
                well_id: image.well_id,
                site_x: image.site_x,
                site_y: image.site_y,
                site_z: image.site_z,
                site_t: image.site_t,
                experiment_channel_id: image.experiment_channel_id,
                coord_x_mm: image.coord_x_mm,
                coord_y_mm: image.coord_y_mm,
                coord_z_um: image.coord_z_um,
                coord_t: image.coord_t,
            };
            t.images.push(image.clone());
            out.push(image);
        }
        Ok(out)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn insert_batch(&self, batch: NewProcessingBatch) -> Result<ProcessingBatch> {
        let mut t = self.tables.lock();
        if t.batches
            .iter()
            .any(|b| b.experiment_id == batch.experiment_id && b.batch_id == batch.batch_id)
        {
            return Err(PlateflowError::DuplicateBatch {
                experiment_id: batch.experiment_id,
                batch_id: batch.batch_id,
            });
        }
        let id = t.allocate_id();
        let row = ProcessingBatch {
            id,
            experiment_id: batch.experiment_id,
            batch_id: batch.batch_id,
            status: batch.status,
            started_at: None,
            ended_at: None,
            created_at: Self::now(),
        };
        t.batches.push(row.clone());
        Ok(row)
    }

    async fn find_batch(
        &self,
        experiment_id: i64,
        batch_id: i64,
    ) -> Result<Option<ProcessingBatch>> {
        let t = self.tables.lock();
        Ok(t.batches
            .iter()
            .find(|b| b.experiment_id == experiment_id && b.batch_id == batch_id)
            .cloned())
    }

    async fn list_batches(&self, experiment_id: i64) -> Result<Vec<ProcessingBatch>> {
        let t = self.tables.lock();
        Ok(t.batches
            .iter()
            .filter(|b| b.experiment_id == experiment_id)
            .cloned()
            .collect())
    }

    async fn max_batch_id(&self, experiment_id: i64) -> Result<Option<i64>> {
        let t = self.tables.lock();
        Ok(t.batches
            .iter()
            .filter(|b| b.experiment_id == experiment_id)
            .map(|b| b.batch_id)
            .max())
    }

    async fn set_batch_state(
        &self,
        row_id: i64,
        status: &str,
        started_at: Option<NaiveDateTime>,
        ended_at: Option<NaiveDateTime>,
    ) -> Result<()> {
        let mut t = self.tables.lock();
        let batch = t
            .batches
            .iter_mut()
            .find(|b| b.id == row_id)
            .ok_or_else(|| {
                PlateflowError::store("set_batch_state", format!("no batch row {row_id}"))
            })?;
        batch.status = status.to_string();
        batch.started_at = started_at;
        batch.ended_at = ended_at;
        Ok(())
    }

    async fn insert_batch_sites(
        &self,
        processing_batch_id: i64,
        site_ids: &[i64],
    ) -> Result<()> {
        let mut t = self.tables.lock();
        for &site_id in site_ids {
            let id = t.allocate_id();
            t.batch_sites.push(BatchSite {
                id,
                processing_batch_id,
                site_id,
            });
        }
        Ok(())
    }

    async fn list_batch_sites(&self, processing_batch_id: i64) -> Result<Vec<BatchSite>> {
        let t = self.tables.lock();
        Ok(t.batch_sites
            .iter()
            .filter(|bs| bs.processing_batch_id == processing_batch_id)
            .cloned()
            .collect())
    }

    async fn insert_result_files(
        &self,
        processing_batch_id: i64,
        files: &[FileRef],
    ) -> Result<()> {
        let mut t = self.tables.lock();
        for file in files {
            let id = t.allocate_id();
            t.result_files.push(ResultFile {
                id,
                processing_batch_id,
                storage_path: file.storage_path.clone(),
                filename: file.filename.clone(),
            });
        }
        Ok(())
    }

    async fn list_result_files(&self, processing_batch_id: i64) -> Result<Vec<ResultFile>> {
        let t = self.tables.lock();
        Ok(t.result_files
            .iter()
            .filter(|rf| rf.processing_batch_id == processing_batch_id)
            .cloned()
            .collect())
    }
}
