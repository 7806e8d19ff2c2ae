use crate::error::Error;
use crate::layout::{MetricKind, ReportLayout};
use crate::report::ReportRow;
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashSet;

/// A named entity referenced by facts, keyed by its natural ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    pub id: i64,
    pub names: Vec<(&'static str, String)>,
    pub parents: Vec<(&'static str, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimensionUpsert {
    Insert(DimensionRecord),
    /// Overwrites the names of an existing record; the latest sighting wins.
    Update(DimensionRecord),
}

impl DimensionUpsert {
    pub fn record(&self) -> &DimensionRecord {
        match self {
            DimensionUpsert::Insert(record) | DimensionUpsert::Update(record) => record,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    Count(i64),
    Money(Decimal),
}

/// One day of metrics for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRecord {
    pub date: NaiveDate,
    pub entity_id: i64,
    pub extra_ids: Vec<(&'static str, i64)>,
    pub currency: Option<String>,
    pub metrics: Vec<(&'static str, MetricValue)>,
}

impl FactRecord {
    /// The values a store must keep unique: date, entity ID, then extra IDs.
    pub fn key(&self) -> (NaiveDate, Vec<i64>) {
        let mut ids = vec![self.entity_id];
        ids.extend(self.extra_ids.iter().map(|(_, id)| *id));
        (self.date, ids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRow {
    pub dimension: DimensionUpsert,
    pub fact: FactRecord,
}

/// Everything a report contributes to the database, committed as one unit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    pub dimensions: Vec<DimensionUpsert>,
    pub facts: Vec<FactRecord>,
    pub skipped_rows: usize,
}

/// Maps a report row to a dimension upsert and a fact insert.
///
/// # Arguments
/// * `layout` - Column mapping of the report type.
/// * `row` - The parsed report row.
/// * `known_ids` - Dimension IDs already stored or seen earlier in the batch;
///   a new ID is added to it.
///
/// # Returns
/// `None` for aggregate rows, otherwise the mapped row. Missing columns and
/// unparsable values are errors.
pub fn map_row(
    layout: &ReportLayout,
    row: &ReportRow,
    known_ids: &mut HashSet<i64>,
) -> Result<Option<MappedRow>, Error> {
    if let Some(sentinel) = layout.aggregate_sentinel {
        if row.get(sentinel.column)? == sentinel.value {
            debug!(
                "Skipping aggregate row at line {} ({} = {})",
                row.line(),
                sentinel.column,
                sentinel.value
            );
            return Ok(None);
        }
    }

    let entity_id = row.id(layout.dimension_key.header)?;

    let names = layout
        .dimension_names
        .iter()
        .map(|c| Ok((c.field, row.get(c.header)?.to_string())))
        .collect::<Result<Vec<_>, Error>>()?;
    let parents = layout
        .dimension_parents
        .iter()
        .map(|c| Ok((c.field, row.id(c.header)?)))
        .collect::<Result<Vec<_>, Error>>()?;

    let extra_ids = layout
        .fact_ids
        .iter()
        .map(|c| Ok((c.field, row.id(c.header)?)))
        .collect::<Result<Vec<_>, Error>>()?;
    let currency = match layout.currency {
        Some(column) => Some(row.get(column.header)?.to_string()),
        None => None,
    };
    let metrics = layout
        .metrics
        .iter()
        .map(|m| {
            let value = match m.kind {
                MetricKind::Count => MetricValue::Count(row.count(m.header)?),
                MetricKind::Money => MetricValue::Money(row.amount(m.header)?),
            };
            Ok((m.field, value))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let fact = FactRecord {
        date: row.date(layout.date_column)?,
        entity_id,
        extra_ids,
        currency,
        metrics,
    };

    let record = DimensionRecord {
        id: entity_id,
        names,
        parents,
    };
    let dimension = if known_ids.insert(entity_id) {
        DimensionUpsert::Insert(record)
    } else {
        DimensionUpsert::Update(record)
    };

    Ok(Some(MappedRow { dimension, fact }))
}

/// Maps every row of a report. The first failing row aborts the whole batch.
pub fn map_rows<I>(layout: &ReportLayout, rows: I, mut known_ids: HashSet<i64>) -> Result<Batch, Error>
where
    I: IntoIterator<Item = Result<ReportRow, Error>>,
{
    let mut batch = Batch::default();

    for row in rows {
        match map_row(layout, &row?, &mut known_ids)? {
            Some(mapped) => {
                batch.dimensions.push(mapped.dimension);
                batch.facts.push(mapped.fact);
            }
            None => batch.skipped_rows += 1,
        }
    }

    Ok(batch)
}
