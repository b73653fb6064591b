use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tabula_core::{
    ExtractionStatus, FileFormat, FileRecord, PipelineError, PipelineRun, Publication, RunStatus,
    SourceId, TableRows,
};

use crate::{KvStore, RecordStore, StoreError};

/// PostgreSQL-backed record store and key-value store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn count_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn count_from_db(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i32 = row.try_get(column)?;
    Ok(u32::try_from(value).unwrap_or_default())
}

fn corrupt(err: tabula_core::ParseError) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn file_from_row(row: &PgRow) -> Result<FileRecord, StoreError> {
    let format: String = row.try_get("format")?;
    let status: String = row.try_get("extraction_status")?;
    let size: i64 = row.try_get("file_size_bytes")?;
    Ok(FileRecord {
        id: row.try_get("id")?,
        publication_id: row.try_get("publication_id")?,
        filename: row.try_get("filename")?,
        format: FileFormat::from_extension(&format),
        download_url: row.try_get("download_url")?,
        storage_key: row.try_get("storage_key")?,
        file_size_bytes: u64::try_from(size).unwrap_or_default(),
        checksum_sha256: row.try_get("checksum_sha256")?,
        is_preferred_format: row.try_get("is_preferred_format")?,
        extraction_status: status.parse().map_err(corrupt)?,
        extraction_request_id: row.try_get("extraction_request_id")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<PipelineRun, StoreError> {
    let status: String = row.try_get("status")?;
    let errors: Json<Vec<PipelineError>> = row.try_get("errors")?;
    Ok(PipelineRun {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: status.parse::<RunStatus>().map_err(corrupt)?,
        sources_checked: count_from_db(row, "sources_checked")?,
        files_discovered: count_from_db(row, "files_discovered")?,
        files_downloaded: count_from_db(row, "files_downloaded")?,
        files_extracted: count_from_db(row, "files_extracted")?,
        extraction_requests_created: count_from_db(row, "extraction_requests_created")?,
        extraction_results_processed: count_from_db(row, "extraction_results_processed")?,
        errors: errors.0,
    })
}

const FILE_COLUMNS: &str = "id, publication_id, filename, format, download_url, storage_key, \
     file_size_bytes, checksum_sha256, is_preferred_format, extraction_status, extraction_request_id";

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO publications
                (id, source_id, title, title_en, publish_date, discovery_url, raw_metadata, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&publication.id)
        .bind(publication.source_id.as_str())
        .bind(&publication.title)
        .bind(&publication.title_en)
        .bind(&publication.publish_date)
        .bind(&publication.discovery_url)
        .bind(Json(&publication.raw_metadata))
        .bind(publication.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_file(&self, file: &FileRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO files
                (id, publication_id, filename, format, download_url, storage_key,
                 file_size_bytes, checksum_sha256, is_preferred_format, extraction_status,
                 extraction_request_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&file.id)
        .bind(&file.publication_id)
        .bind(&file.filename)
        .bind(file.format.as_str())
        .bind(&file.download_url)
        .bind(&file.storage_key)
        .bind(i64::try_from(file.file_size_bytes).unwrap_or(i64::MAX))
        .bind(&file.checksum_sha256)
        .bind(file.is_preferred_format)
        .bind(file.extraction_status.as_str())
        .bind(&file.extraction_request_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn file_by_download_url(&self, url: &str) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE download_url = $1 LIMIT 1"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn files_with_status(
        &self,
        status: ExtractionStatus,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE extraction_status = $1 ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    async fn set_extraction_status(
        &self,
        file_id: &str,
        status: ExtractionStatus,
        request_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE files
               SET extraction_status = $2,
                   extraction_request_id = COALESCE($3, extraction_request_id)
             WHERE id = $1
            "#,
        )
        .bind(file_id)
        .bind(status.as_str())
        .bind(request_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn known_download_urls(&self, sources: &[SourceId]) -> Result<Vec<String>, StoreError> {
        let prefixes: Vec<String> = sources
            .iter()
            .map(|source| format!("{}%", source.publication_prefix()))
            .collect();
        let rows = if prefixes.is_empty() {
            sqlx::query("SELECT download_url FROM files ORDER BY download_url")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(
                "SELECT download_url FROM files WHERE publication_id LIKE ANY($1) ORDER BY download_url",
            )
            .bind(&prefixes)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter()
            .map(|row| row.try_get("download_url").map_err(StoreError::from))
            .collect()
    }

    async fn insert_rows(&self, rows: &TableRows) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        match rows {
            TableRows::HousingPriceIndex(rows) => {
                for row in rows {
                    sqlx::query(
                        r#"
                        INSERT INTO housing_price_index
                            (publication_id, file_id, period, district, index_value, base_year,
                             pct_change_monthly, pct_change_annual, is_new_dwellings)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(&row.publication_id)
                    .bind(&row.file_id)
                    .bind(&row.period)
                    .bind(&row.district)
                    .bind(row.index_value)
                    .bind(row.base_year)
                    .bind(row.pct_change_monthly)
                    .bind(row.pct_change_annual)
                    .bind(row.is_new_dwellings)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            TableRows::AvgApartmentPrices(rows) => {
                for row in rows {
                    sqlx::query(
                        r#"
                        INSERT INTO avg_apartment_prices
                            (publication_id, file_id, period, district, city, rooms,
                             avg_price_nis_thousands, sample_size)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(&row.publication_id)
                    .bind(&row.file_id)
                    .bind(&row.period)
                    .bind(&row.district)
                    .bind(&row.city)
                    .bind(&row.rooms)
                    .bind(row.avg_price_nis_thousands)
                    .bind(row.sample_size.map(|n| i32::try_from(n).unwrap_or(i32::MAX)))
                    .execute(&mut *tx)
                    .await?;
                }
            }
            TableRows::ConsumerPriceIndex(rows) => {
                for row in rows {
                    sqlx::query(
                        r#"
                        INSERT INTO consumer_price_index
                            (publication_id, file_id, period, index_code, index_name_he,
                             index_name_en, index_value, base_year, pct_change_monthly,
                             pct_change_annual)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                        "#,
                    )
                    .bind(&row.publication_id)
                    .bind(&row.file_id)
                    .bind(&row.period)
                    .bind(&row.index_code)
                    .bind(&row.index_name_he)
                    .bind(&row.index_name_en)
                    .bind(row.index_value)
                    .bind(row.base_year)
                    .bind(row.pct_change_monthly)
                    .bind(row.pct_change_annual)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            TableRows::ReviewInsights(rows) => {
                for row in rows {
                    sqlx::query(
                        r#"
                        INSERT INTO review_insights
                            (publication_id, file_id, topic, key_figures, summary,
                             extracted_text, confidence)
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        "#,
                    )
                    .bind(&row.publication_id)
                    .bind(&row.file_id)
                    .bind(&row.topic)
                    .bind(&row.key_figures)
                    .bind(&row.summary)
                    .bind(&row.extracted_text)
                    .bind(row.confidence)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(rows.len())
    }

    async fn upsert_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs
                (id, started_at, finished_at, status, sources_checked, files_discovered,
                 files_downloaded, files_extracted, extraction_requests_created,
                 extraction_results_processed, errors)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                status = EXCLUDED.status,
                sources_checked = EXCLUDED.sources_checked,
                files_discovered = EXCLUDED.files_discovered,
                files_downloaded = EXCLUDED.files_downloaded,
                files_extracted = EXCLUDED.files_extracted,
                extraction_requests_created = EXCLUDED.extraction_requests_created,
                extraction_results_processed = EXCLUDED.extraction_results_processed,
                errors = EXCLUDED.errors
            "#,
        )
        .bind(&run.id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(count_to_db(run.sources_checked))
        .bind(count_to_db(run.files_discovered))
        .bind(count_to_db(run.files_downloaded))
        .bind(count_to_db(run.files_extracted))
        .bind(count_to_db(run.extraction_requests_created))
        .bind(count_to_db(run.extraction_results_processed))
        .bind(Json(&run.errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<PipelineRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, status, sources_checked, files_discovered,
                   files_downloaded, files_extracted, extraction_requests_created,
                   extraction_results_processed, errors
              FROM pipeline_runs
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("value").map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_state (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
