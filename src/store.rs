use crate::error::Error;
use crate::layout::{MetricKind, ReportLayout};
use crate::mapper::{Batch, DimensionRecord, DimensionUpsert, FactRecord, MetricValue};
use chrono::NaiveDate;
use log::info;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::{PgPool, Postgres};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub dimensions_inserted: usize,
    pub dimensions_updated: usize,
    pub facts_inserted: usize,
    /// Facts whose (date, IDs) key was already stored.
    pub facts_ignored: usize,
}

#[async_trait::async_trait]
pub trait ReportStore: Send + Sync {
    /// Creates the layout's tables when they do not exist yet. Existing tables
    /// are left untouched.
    async fn ensure_schema(&self, layout: &ReportLayout) -> Result<(), Error>;

    /// Natural IDs currently in the layout's dimension table.
    async fn dimension_ids(&self, layout: &ReportLayout) -> Result<HashSet<i64>, Error>;

    /// Applies a batch in a single transaction. Facts already present are
    /// ignored rather than stored twice.
    async fn commit(&self, layout: &ReportLayout, batch: &Batch) -> Result<CommitSummary, Error>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Prepares a pool for `db_uri`. Nothing connects until the first query.
    pub fn new(db_uri: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(db_uri)?;
        Ok(PgStore { pool })
    }
}

fn create_dimension_table_sql(layout: &ReportLayout) -> String {
    let mut columns = vec!["id SERIAL PRIMARY KEY".to_string()];
    columns.extend(layout.dimension_names.iter().map(|c| format!("{} TEXT", c.field)));
    columns.extend(
        layout
            .dimension_parents
            .iter()
            .map(|c| format!("{} BIGINT", c.field)),
    );
    columns.push(format!("{} BIGINT NOT NULL UNIQUE", layout.dimension_key.field));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        layout.dimension_table,
        columns.join(", ")
    )
}

fn create_fact_table_sql(layout: &ReportLayout) -> String {
    let mut columns = vec![
        "id SERIAL PRIMARY KEY".to_string(),
        "date DATE NOT NULL".to_string(),
    ];
    columns.extend(
        layout
            .fact_key_fields()
            .iter()
            .map(|field| format!("{} BIGINT NOT NULL", field)),
    );
    columns.extend(layout.currency.iter().map(|c| format!("{} VARCHAR(5)", c.field)));
    columns.extend(layout.metrics.iter().map(|m| match m.kind {
        MetricKind::Count => format!("{} BIGINT", m.field),
        MetricKind::Money => format!("{} NUMERIC(12, 6)", m.field),
    }));
    columns.push(format!(
        "CONSTRAINT {}_unique_per_date UNIQUE (date, {})",
        layout.fact_table,
        layout.fact_key_fields().join(", ")
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        layout.fact_table,
        columns.join(", ")
    )
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_dimension_sql(layout: &ReportLayout) -> String {
    let mut fields = vec![layout.dimension_key.field];
    fields.extend(layout.dimension_names.iter().map(|c| c.field));
    fields.extend(layout.dimension_parents.iter().map(|c| c.field));

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        layout.dimension_table,
        fields.join(", "),
        placeholders(fields.len())
    )
}

fn update_dimension_sql(layout: &ReportLayout) -> String {
    let assignments = layout
        .dimension_names
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", c.field, i + 2))
        .collect::<Vec<_>>();

    format!(
        "UPDATE {} SET {} WHERE {} = $1",
        layout.dimension_table,
        assignments.join(", "),
        layout.dimension_key.field
    )
}

fn insert_fact_sql(layout: &ReportLayout) -> String {
    let key_fields = layout.fact_key_fields();
    let mut fields = vec!["date"];
    fields.extend(key_fields.iter().copied());
    fields.extend(layout.currency.iter().map(|c| c.field));
    fields.extend(layout.metrics.iter().map(|m| m.field));

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT (date, {}) DO NOTHING",
        layout.fact_table,
        fields.join(", "),
        placeholders(fields.len()),
        key_fields.join(", ")
    )
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_fact<'q>(query: PgQuery<'q>, layout: &ReportLayout, fact: &'q FactRecord) -> PgQuery<'q> {
    let mut query = query.bind(fact.date).bind(fact.entity_id);
    for (_, id) in &fact.extra_ids {
        query = query.bind(*id);
    }
    if layout.currency.is_some() {
        query = query.bind(fact.currency.as_deref());
    }
    for (_, value) in &fact.metrics {
        query = match value {
            MetricValue::Count(count) => query.bind(*count),
            MetricValue::Money(amount) => query.bind(*amount),
        };
    }
    query
}

#[async_trait::async_trait]
impl ReportStore for PgStore {
    async fn ensure_schema(&self, layout: &ReportLayout) -> Result<(), Error> {
        sqlx::query(&create_dimension_table_sql(layout))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_fact_table_sql(layout))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dimension_ids(&self, layout: &ReportLayout) -> Result<HashSet<i64>, Error> {
        let sql = format!(
            "SELECT {}::BIGINT FROM {}",
            layout.dimension_key.field, layout.dimension_table
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(ids.into_iter().collect())
    }

    async fn commit(&self, layout: &ReportLayout, batch: &Batch) -> Result<CommitSummary, Error> {
        let insert_dimension = insert_dimension_sql(layout);
        let update_dimension = update_dimension_sql(layout);
        let insert_fact = insert_fact_sql(layout);
        let mut summary = CommitSummary::default();

        let mut tx = self.pool.begin().await?;

        for upsert in &batch.dimensions {
            match upsert {
                DimensionUpsert::Insert(record) => {
                    let mut query = sqlx::query(&insert_dimension).bind(record.id);
                    for (_, name) in &record.names {
                        query = query.bind(name.as_str());
                    }
                    for (_, parent) in &record.parents {
                        query = query.bind(*parent);
                    }
                    query.execute(&mut *tx).await?;
                    summary.dimensions_inserted += 1;
                }
                DimensionUpsert::Update(record) => {
                    let mut query = sqlx::query(&update_dimension).bind(record.id);
                    for (_, name) in &record.names {
                        query = query.bind(name.as_str());
                    }
                    let result = query.execute(&mut *tx).await?;
                    if result.rows_affected() > 0 {
                        summary.dimensions_updated += 1;
                    }
                }
            }
        }

        for fact in &batch.facts {
            let result = bind_fact(sqlx::query(&insert_fact), layout, fact)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                summary.facts_inserted += 1;
            } else {
                summary.facts_ignored += 1;
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}

#[derive(Debug, Default, Clone)]
struct MemoryTables {
    dimensions: BTreeMap<i64, DimensionRecord>,
    facts: BTreeMap<(NaiveDate, Vec<i64>), FactRecord>,
}

/// Keeps tables in memory with the same uniqueness rules as [`PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<&'static str, MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dimensions(&self, layout: &ReportLayout) -> Vec<DimensionRecord> {
        let tables = self.tables.lock().await;
        tables
            .get(layout.name)
            .map(|t| t.dimensions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn facts(&self, layout: &ReportLayout) -> Vec<FactRecord> {
        let tables = self.tables.lock().await;
        tables
            .get(layout.name)
            .map(|t| t.facts.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ReportStore for MemoryStore {
    async fn ensure_schema(&self, layout: &ReportLayout) -> Result<(), Error> {
        self.tables.lock().await.entry(layout.name).or_default();
        Ok(())
    }

    async fn dimension_ids(&self, layout: &ReportLayout) -> Result<HashSet<i64>, Error> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(layout.name)
            .map(|t| t.dimensions.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, layout: &ReportLayout, batch: &Batch) -> Result<CommitSummary, Error> {
        let mut tables = self.tables.lock().await;
        // Work on a copy so a failing batch leaves the stored tables as they were.
        let mut staged = tables.get(layout.name).cloned().unwrap_or_default();
        let mut summary = CommitSummary::default();

        for upsert in &batch.dimensions {
            match upsert {
                DimensionUpsert::Insert(record) => {
                    if staged.dimensions.contains_key(&record.id) {
                        return Err(Error::DuplicateDimension {
                            table: layout.dimension_table.to_string(),
                            id: record.id,
                        });
                    }
                    staged.dimensions.insert(record.id, record.clone());
                    summary.dimensions_inserted += 1;
                }
                DimensionUpsert::Update(record) => {
                    if let Some(existing) = staged.dimensions.get_mut(&record.id) {
                        existing.names = record.names.clone();
                        summary.dimensions_updated += 1;
                    }
                }
            }
        }

        for fact in &batch.facts {
            let key = fact.key();
            if staged.facts.contains_key(&key) {
                summary.facts_ignored += 1;
            } else {
                staged.facts.insert(key, fact.clone());
                summary.facts_inserted += 1;
            }
        }

        tables.insert(layout.name, staged);
        info!(
            "Committed {} in memory: {} facts inserted, {} ignored",
            layout.name, summary.facts_inserted, summary.facts_ignored
        );
        Ok(summary)
    }
}
