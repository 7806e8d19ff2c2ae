//! Column mappings for the report types this tool loads.
//!
//! Every report type is a dimension table keyed by a natural ID plus a fact
//! table keyed by date and entity IDs. A [`ReportLayout`] names the CSV headers
//! feeding each table column, so one pipeline serves every report type.

use crate::api_client::{DateRange, RunQueryRequest};
use crate::error::Error;
use chrono::{Days, NaiveDate};
use chrono_tz::Tz;
use clap::ValueEnum;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Count,
    Money,
}

/// A CSV header and the table column it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub header: &'static str,
    pub field: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricColumn {
    pub header: &'static str,
    pub field: &'static str,
    pub kind: MetricKind,
}

/// Rows whose `column` holds `value` are aggregates and are not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateSentinel {
    pub column: &'static str,
    pub value: &'static str,
}

#[derive(Debug, Clone)]
pub struct ReportLayout {
    pub name: &'static str,
    pub date_column: &'static str,
    pub dimension_table: &'static str,
    pub dimension_key: Column,
    pub dimension_names: &'static [Column],
    pub dimension_parents: &'static [Column],
    pub fact_table: &'static str,
    /// IDs stored on the fact next to the dimension key; part of its unique key.
    pub fact_ids: &'static [Column],
    pub currency: Option<Column>,
    pub aggregate_sentinel: Option<AggregateSentinel>,
    pub metrics: &'static [MetricColumn],
    pub date_range: DateRange,
    pub poll_interval: Duration,
}

impl ReportLayout {
    /// Headers that must be present for a report to be mapped.
    pub fn required_headers(&self) -> Vec<&'static str> {
        let candidates = [self.date_column, self.dimension_key.header]
            .into_iter()
            .chain(self.dimension_names.iter().map(|c| c.header))
            .chain(self.dimension_parents.iter().map(|c| c.header))
            .chain(self.fact_ids.iter().map(|c| c.header))
            .chain(self.currency.iter().map(|c| c.header))
            .chain(self.aggregate_sentinel.iter().map(|s| s.column))
            .chain(self.metrics.iter().map(|m| m.header));

        let mut headers = Vec::new();
        for header in candidates {
            if !headers.contains(&header) {
                headers.push(header);
            }
        }
        headers
    }

    /// Fact columns forming the unique key, after `date`.
    pub fn fact_key_fields(&self) -> Vec<&'static str> {
        let mut fields = vec![self.dimension_key.field];
        fields.extend(self.fact_ids.iter().map(|c| c.field));
        fields
    }
}

pub static BASIC_STATS: ReportLayout = ReportLayout {
    name: "basic-stats",
    date_column: "Date",
    dimension_table: "dbm_meta_names",
    dimension_key: Column {
        header: "Line Item ID",
        field: "line_item_id",
    },
    dimension_names: &[
        Column {
            header: "Advertiser",
            field: "advertiser_name",
        },
        Column {
            header: "Insertion Order",
            field: "order_name",
        },
        Column {
            header: "Line Item",
            field: "line_item_name",
        },
    ],
    dimension_parents: &[
        Column {
            header: "Advertiser ID",
            field: "advertiser_id",
        },
        Column {
            header: "Insertion Order ID",
            field: "order_id",
        },
    ],
    fact_table: "dbm_basic_stats",
    fact_ids: &[],
    currency: Some(Column {
        header: "Advertiser Currency",
        field: "currency",
    }),
    aggregate_sentinel: None,
    metrics: &[
        MetricColumn {
            header: "Impressions",
            field: "impressions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Active View: Viewable Impressions",
            field: "viewable_impressions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Clicks",
            field: "clicks",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Total Conversions",
            field: "total_conversions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Post-Click Conversions",
            field: "post_click_conversions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Total Media Cost (Advertiser Currency)",
            field: "total_cost",
            kind: MetricKind::Money,
        },
        MetricColumn {
            header: "Media Cost (Advertiser Currency)",
            field: "media_cost",
            kind: MetricKind::Money,
        },
    ],
    date_range: DateRange::PreviousDay,
    poll_interval: Duration::from_secs(60),
};

pub static CONVERSION_STATS: ReportLayout = ReportLayout {
    name: "conversion-stats",
    date_column: "Date",
    dimension_table: "dbm_conversion_pixels_meta_names",
    dimension_key: Column {
        header: "DV360 Activity ID",
        field: "conversion_id",
    },
    dimension_names: &[Column {
        header: "DV360 Activity",
        field: "conversion_name",
    }],
    dimension_parents: &[],
    fact_table: "dbm_conversion_pixels",
    fact_ids: &[Column {
        header: "Line Item ID",
        field: "line_item_id",
    }],
    currency: None,
    aggregate_sentinel: Some(AggregateSentinel {
        column: "DV360 Activity",
        value: "Total",
    }),
    metrics: &[
        MetricColumn {
            header: "Total Conversions",
            field: "total_conversions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "Post-Click Conversions",
            field: "post_click_conversions",
            kind: MetricKind::Count,
        },
        MetricColumn {
            header: "CM Post-Click Revenue",
            field: "post_click_revenue",
            kind: MetricKind::Money,
        },
        MetricColumn {
            header: "CM Post-View Revenue",
            field: "post_view_revenue",
            kind: MetricKind::Money,
        },
    ],
    date_range: DateRange::CustomDates,
    poll_interval: Duration::from_secs(30),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportKind {
    BasicStats,
    ConversionStats,
}

impl ReportKind {
    pub fn layout(&self) -> &'static ReportLayout {
        match self {
            ReportKind::BasicStats => &BASIC_STATS,
            ReportKind::ConversionStats => &CONVERSION_STATS,
        }
    }

    /// The run request a scheduled load issues on `today`.
    ///
    /// Custom-date layouts ask for the day before `today`.
    pub fn scheduled_request(&self, today: NaiveDate, timezone: Tz) -> Result<RunQueryRequest, Error> {
        let layout = self.layout();
        let yesterday = today
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| Error::invalid_argument(format!("{} has no previous day", today)))?;

        match layout.date_range {
            DateRange::CustomDates => RunQueryRequest::new(
                DateRange::CustomDates,
                Some(yesterday),
                Some(yesterday),
                timezone,
            ),
            range => RunQueryRequest::new(range, None, None, timezone),
        }
    }
}
