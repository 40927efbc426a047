//! Postgres-backed store. Queries use runtime binding (no compile-time
//! macros) so the crate builds without a live database; only
//! parameterized statements, values are never formatted into query text.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::PgPool;

use super::{BatchStore, CatalogStore, FileRef};
use crate::error::{PlateflowError, Result};
use crate::models::{
    BatchSite, Channel, Experiment, ExperimentChannel, ExperimentWell, Image, Microscope,
    NewChannel, NewExperiment, NewExperimentChannel, NewImage, NewProcessingBatch, Objective,
    Plate, PlateType, ProcessingBatch, Project, ResultFile, Site, Well,
};

/// Production store over a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema if it does not exist. Safe to run repeatedly.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS plate_types (
    id BIGSERIAL PRIMARY KEY,
    model_name TEXT NOT NULL UNIQUE,
    manufacturer TEXT NOT NULL,
    brand TEXT NOT NULL,
    num_wells INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS wells (
    id BIGSERIAL PRIMARY KEY,
    plate_type_id BIGINT NOT NULL REFERENCES plate_types(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    UNIQUE (plate_type_id, name)
);
CREATE TABLE IF NOT EXISTS plates (
    id BIGSERIAL PRIMARY KEY,
    plate_type_id BIGINT NOT NULL REFERENCES plate_types(id) ON DELETE CASCADE,
    barcode TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS microscopes (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS objectives (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS channels (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    is_fluorescence BOOLEAN NOT NULL,
    fluorescence_wavelength_nm INTEGER,
    is_brightfield BOOLEAN NOT NULL,
    brightfield_type TEXT
);
CREATE TABLE IF NOT EXISTS experiments (
    id BIGSERIAL PRIMARY KEY,
    project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    plate_id BIGINT NOT NULL REFERENCES plates(id) ON DELETE CASCADE,
    microscope_id BIGINT NOT NULL REFERENCES microscopes(id) ON DELETE CASCADE,
    objective_id BIGINT NOT NULL REFERENCES objectives(id) ON DELETE CASCADE,
    count_x INTEGER NOT NULL,
    count_y INTEGER NOT NULL,
    count_z INTEGER NOT NULL,
    count_t INTEGER NOT NULL,
    delta_x_mm DOUBLE PRECISION NOT NULL,
    delta_y_mm DOUBLE PRECISION NOT NULL,
    delta_z_um DOUBLE PRECISION NOT NULL,
    delta_t_h DOUBLE PRECISION NOT NULL,
    UNIQUE (project_id, name)
);
CREATE TABLE IF NOT EXISTS experiment_wells (
    id BIGSERIAL PRIMARY KEY,
    experiment_id BIGINT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    well_id BIGINT NOT NULL REFERENCES wells(id) ON DELETE CASCADE,
    cell_line TEXT
);
CREATE TABLE IF NOT EXISTS sites (
    id BIGSERIAL PRIMARY KEY,
    experiment_well_id BIGINT NOT NULL REFERENCES experiment_wells(id) ON DELETE CASCADE,
    site_index BIGINT NOT NULL,
    site_x BIGINT NOT NULL,
    site_y BIGINT NOT NULL,
    site_z BIGINT NOT NULL,
    site_t BIGINT NOT NULL,
    UNIQUE (experiment_well_id, site_index)
);
CREATE TABLE IF NOT EXISTS experiment_channels (
    id BIGSERIAL PRIMARY KEY,
    experiment_id BIGINT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    channel_id BIGINT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    imaging_order_index INTEGER NOT NULL,
    exposure_time_ms DOUBLE PRECISION NOT NULL,
    analog_gain DOUBLE PRECISION NOT NULL,
    illumination_strength DOUBLE PRECISION NOT NULL
);
CREATE TABLE IF NOT EXISTS images (
    id BIGSERIAL PRIMARY KEY,
    plate_id BIGINT NOT NULL REFERENCES plates(id) ON DELETE CASCADE,
    storage_path TEXT NOT NULL,
    well_id BIGINT NOT NULL REFERENCES wells(id) ON DELETE CASCADE,
    site_x BIGINT NOT NULL,
    site_y BIGINT NOT NULL,
    site_z BIGINT NOT NULL,
    site_t BIGINT NOT NULL,
    experiment_channel_id BIGINT NOT NULL REFERENCES experiment_channels(id) ON DELETE CASCADE,
    coord_x_mm DOUBLE PRECISION,
    coord_y_mm DOUBLE PRECISION,
    coord_z_um DOUBLE PRECISION,
    coord_t TIMESTAMP
);
CREATE TABLE IF NOT EXISTS processing_batches (
    id BIGSERIAL PRIMARY KEY,
    experiment_id BIGINT NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    batch_id BIGINT NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMP,
    ended_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL DEFAULT NOW(),
    UNIQUE (experiment_id, batch_id)
);
CREATE TABLE IF NOT EXISTS batch_sites (
    id BIGSERIAL PRIMARY KEY,
    processing_batch_id BIGINT NOT NULL REFERENCES processing_batches(id) ON DELETE CASCADE,
    site_id BIGINT NOT NULL REFERENCES sites(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS result_files (
    id BIGSERIAL PRIMARY KEY,
    processing_batch_id BIGINT NOT NULL REFERENCES processing_batches(id) ON DELETE CASCADE,
    storage_path TEXT NOT NULL,
    filename TEXT NOT NULL
);
"#;

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>("SELECT id, name FROM projects WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(project)
    }

    async fn find_or_create_project(&self, name: &str) -> Result<Project> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(project)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let projects =
            sqlx::query_as::<_, Project>("SELECT id, name FROM projects ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(projects)
    }

    async fn find_plate_type(&self, model_name: &str) -> Result<Option<PlateType>> {
        let plate_type = sqlx::query_as::<_, PlateType>(
            "SELECT id, model_name, manufacturer, brand, num_wells FROM plate_types WHERE model_name = $1",
        )
        .bind(model_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plate_type)
    }

    async fn insert_plate_type(
        &self,
        model_name: &str,
        manufacturer: &str,
        brand: &str,
        num_wells: i32,
        well_names: &[String],
    ) -> Result<PlateType> {
        let mut tx = self.pool.begin().await?;
        let plate_type = sqlx::query_as::<_, PlateType>(
            r#"
            INSERT INTO plate_types (model_name, manufacturer, brand, num_wells)
            VALUES ($1, $2, $3, $4)
            RETURNING id, model_name, manufacturer, brand, num_wells
            "#,
        )
        .bind(model_name)
        .bind(manufacturer)
        .bind(brand)
        .bind(num_wells)
        .fetch_one(&mut *tx)
        .await?;

        for name in well_names {
            sqlx::query("INSERT INTO wells (plate_type_id, name) VALUES ($1, $2)")
                .bind(plate_type.id)
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(plate_type)
    }

    async fn find_well(&self, plate_type_id: i64, name: &str) -> Result<Option<Well>> {
        let well = sqlx::query_as::<_, Well>(
            "SELECT id, plate_type_id, name FROM wells WHERE plate_type_id = $1 AND name = $2",
        )
        .bind(plate_type_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(well)
    }

    async fn find_or_create_plate(&self, plate_type_id: i64, barcode: &str) -> Result<Plate> {
        let plate = sqlx::query_as::<_, Plate>(
            r#"
            INSERT INTO plates (plate_type_id, barcode) VALUES ($1, $2)
            ON CONFLICT (barcode) DO UPDATE SET barcode = EXCLUDED.barcode
            RETURNING id, plate_type_id, barcode
            "#,
        )
        .bind(plate_type_id)
        .bind(barcode)
        .fetch_one(&self.pool)
        .await?;
        Ok(plate)
    }

    async fn find_or_create_microscope(&self, name: &str) -> Result<Microscope> {
        let microscope = sqlx::query_as::<_, Microscope>(
            r#"
            INSERT INTO microscopes (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(microscope)
    }

    async fn find_or_create_objective(&self, name: &str) -> Result<Objective> {
        let objective = sqlx::query_as::<_, Objective>(
            r#"
            INSERT INTO objectives (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(objective)
    }

    async fn find_channel(&self, name: &str) -> Result<Option<Channel>> {
        let channel = sqlx::query_as::<_, Channel>(
            r#"
            SELECT id, name, is_fluorescence, fluorescence_wavelength_nm,
                   is_brightfield, brightfield_type
            FROM channels WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn insert_channel(&self, channel: NewChannel) -> Result<Channel> {
        let channel = sqlx::query_as::<_, Channel>(
            r#"
            INSERT INTO channels (name, is_fluorescence, fluorescence_wavelength_nm,
                                  is_brightfield, brightfield_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, is_fluorescence, fluorescence_wavelength_nm,
                      is_brightfield, brightfield_type
            "#,
        )
        .bind(channel.name)
        .bind(channel.is_fluorescence)
        .bind(channel.fluorescence_wavelength_nm)
        .bind(channel.is_brightfield)
        .bind(channel.brightfield_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn find_experiment(&self, project_id: i64, name: &str) -> Result<Option<Experiment>> {
        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            SELECT id, project_id, name, description, plate_id, microscope_id, objective_id,
                   count_x, count_y, count_z, count_t,
                   delta_x_mm, delta_y_mm, delta_z_um, delta_t_h
            FROM experiments WHERE project_id = $1 AND name = $2
            "#,
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(experiment)
    }

    async fn insert_experiment(&self, experiment: NewExperiment) -> Result<Experiment> {
        let experiment = sqlx::query_as::<_, Experiment>(
            r#"
            INSERT INTO experiments (
                project_id, name, description, plate_id, microscope_id, objective_id,
                count_x, count_y, count_z, count_t,
                delta_x_mm, delta_y_mm, delta_z_um, delta_t_h
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id, project_id, name, description, plate_id, microscope_id, objective_id,
                      count_x, count_y, count_z, count_t,
                      delta_x_mm, delta_y_mm, delta_z_um, delta_t_h
            "#,
        )
        .bind(experiment.project_id)
        .bind(experiment.name)
        .bind(experiment.description)
        .bind(experiment.plate_id)
        .bind(experiment.microscope_id)
        .bind(experiment.objective_id)
        .bind(experiment.count_x)
        .bind(experiment.count_y)
        .bind(experiment.count_z)
        .bind(experiment.count_t)
        .bind(experiment.delta_x_mm)
        .bind(experiment.delta_y_mm)
        .bind(experiment.delta_z_um)
        .bind(experiment.delta_t_h)
        .fetch_one(&self.pool)
        .await?;
        Ok(experiment)
    }

    async fn list_experiments(&self, project_id: i64) -> Result<Vec<Experiment>> {
        let experiments = sqlx::query_as::<_, Experiment>(
            r#"
            SELECT id, project_id, name, description, plate_id, microscope_id, objective_id,
                   count_x, count_y, count_z, count_t,
                   delta_x_mm, delta_y_mm, delta_z_um, delta_t_h
            FROM experiments WHERE project_id = $1 ORDER BY name
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(experiments)
    }

    async fn find_or_create_experiment_well(
        &self,
        experiment_id: i64,
        well_id: i64,
        cell_line: Option<&str>,
    ) -> Result<ExperimentWell> {
        let existing = sqlx::query_as::<_, ExperimentWell>(
            r#"
            SELECT id, experiment_id, well_id, cell_line
            FROM experiment_wells
            WHERE experiment_id = $1 AND well_id = $2 AND cell_line IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(experiment_id)
        .bind(well_id)
        .bind(cell_line)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(ew) = existing {
            return Ok(ew);
        }

        let ew = sqlx::query_as::<_, ExperimentWell>(
            r#"
            INSERT INTO experiment_wells (experiment_id, well_id, cell_line)
            VALUES ($1, $2, $3)
            RETURNING id, experiment_id, well_id, cell_line
            "#,
        )
        .bind(experiment_id)
        .bind(well_id)
        .bind(cell_line)
        .fetch_one(&self.pool)
        .await?;
        Ok(ew)
    }

    async fn list_experiment_wells(
        &self,
        experiment_id: i64,
    ) -> Result<Vec<(ExperimentWell, Well)>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: i64,
            experiment_id: i64,
            well_id: i64,
            cell_line: Option<String>,
            w_id: i64,
            plate_type_id: i64,
            name: String,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT ew.id, ew.experiment_id, ew.well_id, ew.cell_line,
                   w.id AS w_id, w.plate_type_id, w.name
            FROM experiment_wells ew
            JOIN wells w ON w.id = ew.well_id
            WHERE ew.experiment_id = $1
            ORDER BY w.name
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ExperimentWell {
                        id: r.id,
                        experiment_id: r.experiment_id,
                        well_id: r.well_id,
                        cell_line: r.cell_line,
                    },
                    Well {
                        id: r.w_id,
                        plate_type_id: r.plate_type_id,
                        name: r.name,
                    },
                )
            })
            .collect())
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
        let site = sqlx::query_as::<_, Site>(
            r#"
            INSERT INTO sites (experiment_well_id, site_index, site_x, site_y, site_z, site_t)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (experiment_well_id, site_index) DO UPDATE
                SET site_index = EXCLUDED.site_index
            RETURNING id, experiment_well_id, site_index, site_x, site_y, site_z, site_t
            "#,
        )
        .bind(experiment_well_id)
        .bind(site_index)
        .bind(site_x)
        .bind(site_y)
        .bind(site_z)
        .bind(site_t)
        .fetch_one(&self.pool)
        .await?;
        Ok(site)
    }

    async fn list_sites(&self, experiment_id: i64) -> Result<Vec<(Site, String)>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            id: i64,
            experiment_well_id: i64,
            site_index: i64,
            site_x: i64,
            site_y: i64,
            site_z: i64,
            site_t: i64,
            well_name: String,
        }

        let rows = sqlx::query_as::<_, Row>(
            r#"
            SELECT s.id, s.experiment_well_id, s.site_index,
                   s.site_x, s.site_y, s.site_z, s.site_t,
                   w.name AS well_name
            FROM sites s
            JOIN experiment_wells ew ON ew.id = s.experiment_well_id
            JOIN wells w ON w.id = ew.well_id
            WHERE ew.experiment_id = $1
            ORDER BY w.name, s.site_index
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    Site {
                        id: r.id,
                        experiment_well_id: r.experiment_well_id,
                        site_index: r.site_index,
                        site_x: r.site_x,
                        site_y: r.site_y,
                        site_z: r.site_z,
                        site_t: r.site_t,
                    },
                    r.well_name,
                )
            })
            .collect())
    }

    async fn find_site(
        &self,
        experiment_id: i64,
        well_name: &str,
        site_index: i64,
    ) -> Result<Option<Site>> {
        let site = sqlx::query_as::<_, Site>(
            r#"
            SELECT s.id, s.experiment_well_id, s.site_index,
                   s.site_x, s.site_y, s.site_z, s.site_t
            FROM sites s
            JOIN experiment_wells ew ON ew.id = s.experiment_well_id
            JOIN wells w ON w.id = ew.well_id
            WHERE ew.experiment_id = $1 AND w.name = $2 AND s.site_index = $3
            "#,
        )
        .bind(experiment_id)
        .bind(well_name)
        .bind(site_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(site)
    }

    async fn insert_experiment_channel(
        &self,
        channel: NewExperimentChannel,
    ) -> Result<ExperimentChannel> {
        let channel = sqlx::query_as::<_, ExperimentChannel>(
            r#"
            INSERT INTO experiment_channels (
                experiment_id, channel_id, imaging_order_index,
                exposure_time_ms, analog_gain, illumination_strength
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, experiment_id, channel_id, imaging_order_index,
                      exposure_time_ms, analog_gain, illumination_strength
            "#,
        )
        .bind(channel.experiment_id)
        .bind(channel.channel_id)
        .bind(channel.imaging_order_index)
        .bind(channel.exposure_time_ms)
        .bind(channel.analog_gain)
        .bind(channel.illumination_strength)
        .fetch_one(&self.pool)
        .await?;
        Ok(channel)
    }

    async fn list_experiment_channels(
        &self,
        experiment_id: i64,
    ) -> Result<Vec<ExperimentChannel>> {
        let channels = sqlx::query_as::<_, ExperimentChannel>(
            r#"
            SELECT id, experiment_id, channel_id, imaging_order_index,
                   exposure_time_ms, analog_gain, illumination_strength
            FROM experiment_channels
            WHERE experiment_id = $1
            ORDER BY imaging_order_index
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(channels)
    }

    async fn insert_images(&self, images: Vec<NewImage>) -> Result<Vec<Image>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(images.len());
        for image in images {
            let row = sqlx::query_as::<_, Image>(
                r#"
                INSERT INTO images (
                    plate_id, storage_path, well_id,
                    site_x, site_y, site_z, site_t,
                    experiment_channel_id, coord_x_mm, coord_y_mm, coord_z_um, coord_t
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING id, plate_id, storage_path, well_id,
                          site_x, site_y, site_z, site_t,
                          experiment_channel_id, coord_x_mm, coord_y_mm, coord_z_um, coord_t
                "#,
            )
            .bind(image.plate_id)
            .bind(image.storage_path)
            .bind(image.well_id)
            .bind(image.site_x)
            .bind(image.site_y)
            .bind(image.site_z)
            .bind(image.site_t)
            .bind(image.experiment_channel_id)
            .bind(image.coord_x_mm)
            .bind(image.coord_y_mm)
            .bind(image.coord_z_um)
            .bind(image.coord_t)
            .fetch_one(&mut *tx)
            .await?;
            out.push(row);
        }
        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl BatchStore for PostgresStore {
    async fn insert_batch(&self, batch: NewProcessingBatch) -> Result<ProcessingBatch> {
        let result = sqlx::query_as::<_, ProcessingBatch>(
            r#"
            INSERT INTO processing_batches (experiment_id, batch_id, status)
            VALUES ($1, $2, $3)
            RETURNING id, experiment_id, batch_id, status, started_at, ended_at, created_at
            "#,
        )
        .bind(batch.experiment_id)
        .bind(batch.batch_id)
        .bind(&batch.status)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(PlateflowError::DuplicateBatch {
                    experiment_id: batch.experiment_id,
                    batch_id: batch.batch_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_batch(
        &self,
        experiment_id: i64,
        batch_id: i64,
    ) -> Result<Option<ProcessingBatch>> {
        let batch = sqlx::query_as::<_, ProcessingBatch>(
            r#"
            SELECT id, experiment_id, batch_id, status, started_at, ended_at, created_at
            FROM processing_batches
            WHERE experiment_id = $1 AND batch_id = $2
            "#,
        )
        .bind(experiment_id)
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(batch)
    }

    async fn list_batches(&self, experiment_id: i64) -> Result<Vec<ProcessingBatch>> {
        let batches = sqlx::query_as::<_, ProcessingBatch>(
            r#"
            SELECT id, experiment_id, batch_id, status, started_at, ended_at, created_at
            FROM processing_batches
            WHERE experiment_id = $1
            ORDER BY batch_id
            "#,
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(batches)
    }

    async fn max_batch_id(&self, experiment_id: i64) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(batch_id) FROM processing_batches WHERE experiment_id = $1",
        )
        .bind(experiment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn set_batch_state(
        &self,
        row_id: i64,
        status: &str,
        started_at: Option<NaiveDateTime>,
        ended_at: Option<NaiveDateTime>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processing_batches
            SET status = $2, started_at = $3, ended_at = $4
            WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(status)
        .bind(started_at)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_batch_sites(
        &self,
        processing_batch_id: i64,
        site_ids: &[i64],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for &site_id in site_ids {
            sqlx::query("INSERT INTO batch_sites (processing_batch_id, site_id) VALUES ($1, $2)")
                .bind(processing_batch_id)
                .bind(site_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_batch_sites(&self, processing_batch_id: i64) -> Result<Vec<BatchSite>> {
        let sites = sqlx::query_as::<_, BatchSite>(
            "SELECT id, processing_batch_id, site_id FROM batch_sites WHERE processing_batch_id = $1",
        )
        .bind(processing_batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sites)
    }

    async fn insert_result_files(
        &self,
        processing_batch_id: i64,
        files: &[FileRef],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for file in files {
            sqlx::query(
                "INSERT INTO result_files (processing_batch_id, storage_path, filename) VALUES ($1, $2, $3)",
            )
            .bind(processing_batch_id)
            .bind(&file.storage_path)
            .bind(&file.filename)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_result_files(&self, processing_batch_id: i64) -> Result<Vec<ResultFile>> {
        let files = sqlx::query_as::<_, ResultFile>(
            r#"
            SELECT id, processing_batch_id, storage_path, filename
            FROM result_files
            WHERE processing_batch_id = $1
            "#,
        )
        .bind(processing_batch_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }
}
