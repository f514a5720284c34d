//! The Storage Manager: the only component that talks SQL.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use super::circuit_breaker::WriteCircuitBreaker;
use super::migrations::run_migrations;
use super::pool::{init_db_pool_with_path, lease, ConnectionSlot};
use super::stats::{StorageCounters, StorageStats};
use crate::config::{DEFAULT_SEARCH_LIMIT, MAX_POOL_CONNECTIONS};
use crate::error_handling::StorageError;
use crate::models::{Apn, DataSource, DependentRecord, PropertyRecord, SalesRecord, SearchCriteria, TaxRecord};

/// Result of `bulk_upsert`: records are written independently, so one bad
/// record does not sink the batch.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: usize,
    pub failed: Vec<(String, StorageError)>,
}

const PROPERTY_COLUMNS: &str = "apn, owner_name, situs_address, mailing_address, legal_description, \
     land_use, assessed_land_value, assessed_improvement_value, assessed_total_value, \
     year_built, lot_size_sqft, raw_source, source, updated_at";

/// Pooled, thread-safe access to the property store.
///
/// Cheap to clone; clones share the pool, counters and circuit breaker.
#[derive(Clone)]
pub struct StorageManager {
    pool: SqlitePool,
    acquire_timeout: Duration,
    breaker: Arc<WriteCircuitBreaker>,
    counters: Arc<StorageCounters>,
}

impl StorageManager {
    /// Opens the database file, applies migrations, and returns a manager.
    pub async fn open(
        db_path: &Path,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StorageError> {
        if max_connections == 0 || max_connections > MAX_POOL_CONNECTIONS {
            return Err(StorageError::InvalidConfig(format!(
                "pool size must be between 1 and {MAX_POOL_CONNECTIONS}, got {max_connections}"
            )));
        }
        let pool = init_db_pool_with_path(db_path, max_connections, acquire_timeout).await?;
        run_migrations(&pool).await?;
        log::info!(
            "Store ready at {} ({} connections, {:?} acquire timeout)",
            db_path.display(),
            max_connections,
            acquire_timeout
        );
        Ok(Self::from_pool(pool, acquire_timeout))
    }

    /// Wraps an already-migrated pool.
    pub fn from_pool(pool: SqlitePool, acquire_timeout: Duration) -> Self {
        StorageManager {
            pool,
            acquire_timeout,
            breaker: Arc::new(WriteCircuitBreaker::new()),
            counters: Arc::new(StorageCounters::new()),
        }
    }

    /// Replaces the circuit breaker, mainly to tune thresholds.
    pub fn with_circuit_breaker(mut self, breaker: WriteCircuitBreaker) -> Self {
        self.breaker = Arc::new(breaker);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Leases a connection slot directly.
    pub async fn lease(&self) -> Result<ConnectionSlot, StorageError> {
        lease(&self.pool, self.acquire_timeout).await
    }

    pub async fn upsert_property(&self, record: &PropertyRecord) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.write_property(record).await;
        self.counters.record(started.elapsed(), &result);
        result
    }

    pub async fn upsert_dependent(&self, record: DependentRecord) -> Result<(), StorageError> {
        self.upsert_dependents(std::slice::from_ref(&record)).await
    }

    /// Writes dependent rows in one transaction, creating stub parents as
    /// needed. An empty slice is a no-op.
    pub async fn upsert_dependents(&self, records: &[DependentRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.write_dependents(records).await;
        self.counters.record(started.elapsed(), &result);
        result
    }

    /// Loads a property with its tax and sales history.
    pub async fn query(&self, apn: &Apn) -> Result<PropertyRecord, StorageError> {
        let started = Instant::now();
        let result = self.load_property(apn).await;
        self.counters.record(started.elapsed(), &result);
        result
    }

    /// Finds properties matching every set criterion, ordered by APN.
    ///
    /// Owner and address filters are case-insensitive substring matches. Empty
    /// criteria are rejected rather than returning the whole store.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<PropertyRecord>, StorageError> {
        let started = Instant::now();
        let result = self.find_properties(criteria).await;
        self.counters.record(started.elapsed(), &result);
        result
    }

    pub async fn bulk_upsert(&self, records: &[PropertyRecord]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for record in records {
            match self.upsert_property(record).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    log::warn!("Bulk upsert of {} failed: {e}", record.apn);
                    outcome.failed.push((record.apn.clone(), e));
                }
            }
        }
        outcome
    }

    pub fn stats(&self) -> StorageStats {
        self.counters
            .snapshot(self.pool.size(), self.pool.num_idle(), self.breaker.is_open())
    }

    /// Round-trips a trivial query through a leased slot.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut slot = self.lease().await?;
        sqlx::query("SELECT 1").execute(&mut *slot).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_property(&self, apn: &Apn) -> Result<PropertyRecord, StorageError> {
        let mut slot = self.lease().await?;
        let row = sqlx::query(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE apn = ?"
        ))
        .bind(apn.as_str())
        .fetch_optional(&mut *slot)
        .await?
        .ok_or_else(|| StorageError::NotFound(apn.to_string()))?;

        let mut record = property_from_row(&row)?;
        attach_history(&mut slot, &mut record).await?;
        Ok(record)
    }

    async fn find_properties(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<PropertyRecord>, StorageError> {
        if criteria.is_empty() {
            return Err(StorageError::InvalidRecord(
                "search needs at least one of apn, owner or address".into(),
            ));
        }
        let mut slot = self.lease().await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {PROPERTY_COLUMNS} FROM properties WHERE 1 = 1"
        ));
        if let Some(apn) = non_blank(&criteria.apn) {
            builder.push(" AND apn = ").push_bind(apn.to_string());
        }
        if let Some(owner) = non_blank(&criteria.owner_contains) {
            builder
                .push(" AND owner_name LIKE ")
                .push_bind(like_pattern(owner))
                .push(" ESCAPE '\\'");
        }
        if let Some(address) = non_blank(&criteria.address_contains) {
            builder
                .push(" AND situs_address LIKE ")
                .push_bind(like_pattern(address))
                .push(" ESCAPE '\\'");
        }
        let limit = criteria.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
        builder.push(" ORDER BY apn LIMIT ").push_bind(i64::from(limit));

        let rows = builder.build().fetch_all(&mut *slot).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = property_from_row(row)?;
            attach_history(&mut slot, &mut record).await?;
            records.push(record);
        }
        Ok(records)
    }

    async fn write_property(&self, record: &PropertyRecord) -> Result<(), StorageError> {
        validate_property(record)?;
        self.breaker.check()?;
        let mut slot = self.lease().await?;
        let result = upsert_property_row(&mut slot, record).await;
        self.note_write(&result);
        result
    }

    async fn write_dependents(&self, records: &[DependentRecord]) -> Result<(), StorageError> {
        for record in records {
            validate_dependent(record)?;
        }
        self.breaker.check()?;
        let mut slot = self.lease().await?;
        let result = upsert_dependent_rows(&mut slot, records).await;
        self.note_write(&result);
        result
    }

    fn note_write(&self, result: &Result<(), StorageError>) {
        match result {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                log::warn!("Store write failed: {e}");
                self.breaker.record_failure();
            }
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn like_pattern(fragment: &str) -> String {
    let escaped = fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn validate_property(record: &PropertyRecord) -> Result<(), StorageError> {
    if record.apn.trim().is_empty() {
        return Err(StorageError::InvalidRecord("property is missing its APN".into()));
    }
    Ok(())
}

fn validate_dependent(record: &DependentRecord) -> Result<(), StorageError> {
    if record.apn().trim().is_empty() {
        return Err(StorageError::InvalidRecord(format!(
            "{} record is missing its APN",
            record.kind()
        )));
    }
    match record {
        DependentRecord::Tax(tax) if tax.tax_year <= 0 => Err(StorageError::InvalidRecord(
            format!("tax record for {} has no tax year", tax.apn),
        )),
        DependentRecord::Sales(sale)
            if NaiveDate::parse_from_str(&sale.sale_date, "%Y-%m-%d").is_err() =>
        {
            Err(StorageError::InvalidRecord(format!(
                "sale for {} has invalid date {:?}",
                sale.apn, sale.sale_date
            )))
        }
        _ => Ok(()),
    }
}

async fn upsert_property_row(
    conn: &mut SqliteConnection,
    record: &PropertyRecord,
) -> Result<(), StorageError> {
    let now = now_rfc3339();
    let raw_source = record
        .raw_source
        .as_ref()
        .map(serde_json::Value::to_string);

    sqlx::query(
        "INSERT INTO properties (
            apn, owner_name, situs_address, mailing_address, legal_description, land_use,
            assessed_land_value, assessed_improvement_value, assessed_total_value,
            year_built, lot_size_sqft, raw_source, source, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(apn) DO UPDATE SET
            owner_name = COALESCE(excluded.owner_name, properties.owner_name),
            situs_address = COALESCE(excluded.situs_address, properties.situs_address),
            mailing_address = COALESCE(excluded.mailing_address, properties.mailing_address),
            legal_description = COALESCE(excluded.legal_description, properties.legal_description),
            land_use = COALESCE(excluded.land_use, properties.land_use),
            assessed_land_value = COALESCE(excluded.assessed_land_value, properties.assessed_land_value),
            assessed_improvement_value = COALESCE(excluded.assessed_improvement_value, properties.assessed_improvement_value),
            assessed_total_value = COALESCE(excluded.assessed_total_value, properties.assessed_total_value),
            year_built = COALESCE(excluded.year_built, properties.year_built),
            lot_size_sqft = COALESCE(excluded.lot_size_sqft, properties.lot_size_sqft),
            raw_source = COALESCE(excluded.raw_source, properties.raw_source),
            source = COALESCE(excluded.source, properties.source),
            updated_at = excluded.updated_at",
    )
    .bind(record.apn.trim())
    .bind(&record.owner_name)
    .bind(&record.situs_address)
    .bind(&record.mailing_address)
    .bind(&record.legal_description)
    .bind(&record.land_use)
    .bind(record.assessed_land_value)
    .bind(record.assessed_improvement_value)
    .bind(record.assessed_total_value)
    .bind(record.year_built)
    .bind(record.lot_size_sqft)
    .bind(raw_source)
    .bind(record.source.map(|s| s.as_str()))
    .bind(&now)
    .bind(&now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Stub parents and dependent rows, all in one transaction.
async fn upsert_dependent_rows(
    conn: &mut SqliteConnection,
    records: &[DependentRecord],
) -> Result<(), StorageError> {
    let mut tx = conn.begin().await?;
    for record in records {
        ensure_parent(&mut tx, record.apn()).await?;
        match record {
            DependentRecord::Tax(tax) => upsert_tax_row(&mut tx, tax).await?,
            DependentRecord::Sales(sale) => upsert_sales_row(&mut tx, sale).await?,
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Inserts a stub parent unless the property already exists.
async fn ensure_parent(conn: &mut SqliteConnection, apn: &str) -> Result<(), StorageError> {
    let now = now_rfc3339();
    let inserted = sqlx::query(
        "INSERT INTO properties (apn, created_at, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(apn) DO NOTHING",
    )
    .bind(apn.trim())
    .bind(&now)
    .bind(&now)
    .execute(conn)
    .await?
    .rows_affected();
    if inserted > 0 {
        log::debug!("Created stub property {apn} for dependent rows");
    }
    Ok(())
}

async fn upsert_tax_row(conn: &mut SqliteConnection, tax: &TaxRecord) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO tax_history (apn, tax_year, assessed_value, tax_amount, tax_paid, delinquent, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(apn, tax_year) DO UPDATE SET
            assessed_value = COALESCE(excluded.assessed_value, tax_history.assessed_value),
            tax_amount = COALESCE(excluded.tax_amount, tax_history.tax_amount),
            tax_paid = COALESCE(excluded.tax_paid, tax_history.tax_paid),
            delinquent = excluded.delinquent,
            updated_at = excluded.updated_at",
    )
    .bind(tax.apn.trim())
    .bind(tax.tax_year)
    .bind(tax.assessed_value)
    .bind(tax.tax_amount)
    .bind(tax.tax_paid)
    .bind(tax.delinquent)
    .bind(now_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

async fn upsert_sales_row(conn: &mut SqliteConnection, sale: &SalesRecord) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO sales_history (apn, sale_date, sale_price, buyer, seller, deed_type, document_number, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(apn, sale_date) DO UPDATE SET
            sale_price = COALESCE(excluded.sale_price, sales_history.sale_price),
            buyer = COALESCE(excluded.buyer, sales_history.buyer),
            seller = COALESCE(excluded.seller, sales_history.seller),
            deed_type = COALESCE(excluded.deed_type, sales_history.deed_type),
            document_number = COALESCE(excluded.document_number, sales_history.document_number),
            updated_at = excluded.updated_at",
    )
    .bind(sale.apn.trim())
    .bind(&sale.sale_date)
    .bind(sale.sale_price)
    .bind(&sale.buyer)
    .bind(&sale.seller)
    .bind(&sale.deed_type)
    .bind(&sale.document_number)
    .bind(now_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

async fn attach_history(
    conn: &mut SqliteConnection,
    record: &mut PropertyRecord,
) -> Result<(), StorageError> {
    let tax_rows = sqlx::query(
        "SELECT apn, tax_year, assessed_value, tax_amount, tax_paid, delinquent
         FROM tax_history WHERE apn = ? ORDER BY tax_year DESC",
    )
    .bind(&record.apn)
    .fetch_all(&mut *conn)
    .await?;
    record.tax_history = tax_rows
        .iter()
        .map(|row| {
            Ok(TaxRecord {
                apn: row.try_get("apn")?,
                tax_year: row.try_get("tax_year")?,
                assessed_value: row.try_get("assessed_value")?,
                tax_amount: row.try_get("tax_amount")?,
                tax_paid: row.try_get("tax_paid")?,
                delinquent: row.try_get("delinquent")?,
            })
        })
        .collect::<Result<_, sqlx::Error>>()?;

    let sales_rows = sqlx::query(
        "SELECT apn, sale_date, sale_price, buyer, seller, deed_type, document_number
         FROM sales_history WHERE apn = ? ORDER BY sale_date DESC",
    )
    .bind(&record.apn)
    .fetch_all(&mut *conn)
    .await?;
    record.sales_history = sales_rows
        .iter()
        .map(|row| {
            Ok(SalesRecord {
                apn: row.try_get("apn")?,
                sale_date: row.try_get("sale_date")?,
                sale_price: row.try_get("sale_price")?,
                buyer: row.try_get("buyer")?,
                seller: row.try_get("seller")?,
                deed_type: row.try_get("deed_type")?,
                document_number: row.try_get("document_number")?,
            })
        })
        .collect::<Result<_, sqlx::Error>>()?;
    Ok(())
}

fn property_from_row(row: &SqliteRow) -> Result<PropertyRecord, StorageError> {
    let raw_source: Option<String> = row.try_get("raw_source")?;
    let source: Option<String> = row.try_get("source")?;
    Ok(PropertyRecord {
        apn: row.try_get("apn")?,
        owner_name: row.try_get("owner_name")?,
        situs_address: row.try_get("situs_address")?,
        mailing_address: row.try_get("mailing_address")?,
        legal_description: row.try_get("legal_description")?,
        land_use: row.try_get("land_use")?,
        assessed_land_value: row.try_get("assessed_land_value")?,
        assessed_improvement_value: row.try_get("assessed_improvement_value")?,
        assessed_total_value: row.try_get("assessed_total_value")?,
        year_built: row.try_get("year_built")?,
        lot_size_sqft: row.try_get("lot_size_sqft")?,
        raw_source: raw_source.and_then(|raw| serde_json::from_str(&raw).ok()),
        source: source.as_deref().and_then(DataSource::from_db),
        updated_at: row.try_get("updated_at")?,
        tax_history: Vec::new(),
        sales_history: Vec::new(),
    })
}
