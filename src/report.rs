use crate::error::Error;
use crate::normalize::{parse_count, parse_currency, parse_date};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, StringRecordsIntoIter};
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// One data row of a downloaded report with typed accessors by header name.
#[derive(Debug, Clone)]
pub struct ReportRow {
    line: u64,
    record: StringRecord,
    columns: Arc<HashMap<String, usize>>,
}

impl ReportRow {
    /// Line of the row in the report file, header included.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Raw cell value. A row shorter than the header yields an empty string
    /// for the trailing columns.
    pub fn get(&self, column: &str) -> Result<&str, Error> {
        let index = self
            .columns
            .get(column)
            .ok_or_else(|| Error::MissingColumn {
                column: column.to_string(),
            })?;

        Ok(self.record.get(*index).map(str::trim).unwrap_or(""))
    }

    pub fn date(&self, column: &str) -> Result<NaiveDate, Error> {
        self.parsed(column, parse_date)
    }

    pub fn amount(&self, column: &str) -> Result<Decimal, Error> {
        self.parsed(column, parse_currency)
    }

    pub fn count(&self, column: &str) -> Result<i64, Error> {
        self.parsed(column, parse_count)
    }

    pub fn id(&self, column: &str) -> Result<i64, Error> {
        self.parsed(column, parse_count)
    }

    fn parsed<T>(&self, column: &str, parse: fn(&str) -> Result<T, Error>) -> Result<T, Error> {
        let raw = self.get(column)?;
        parse(raw).map_err(|source| Error::InvalidField {
            line: self.line,
            column: column.to_string(),
            source: Box::new(source),
        })
    }
}

/// Single-pass iterator over the data rows of a report.
///
/// Iteration ends at the first row whose date column is empty: DBM appends a
/// summary and metadata block after the data, and that row is where it starts.
pub struct ReportRows<'a> {
    records: StringRecordsIntoIter<&'a [u8]>,
    columns: Arc<HashMap<String, usize>>,
    date_index: usize,
    finished: bool,
}

/// Opens a report and checks its header.
///
/// # Arguments
/// * `bytes` - The CSV file as downloaded.
/// * `date_column` - Header of the column whose first empty cell ends the data.
/// * `required` - Headers that must be present.
///
/// # Returns
/// The row iterator, or [`Error::MissingColumn`] for the first absent header.
pub fn parse_rows<'a>(
    bytes: &'a [u8],
    date_column: &str,
    required: &[&str],
) -> Result<ReportRows<'a>, Error> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let mut columns = HashMap::new();
    for (index, header) in reader.headers()?.iter().enumerate() {
        columns.entry(header.to_string()).or_insert(index);
    }

    for column in required.iter().chain(std::iter::once(&date_column)) {
        if !columns.contains_key(*column) {
            return Err(Error::MissingColumn {
                column: column.to_string(),
            });
        }
    }

    let date_index = columns[date_column];

    Ok(ReportRows {
        records: reader.into_records(),
        columns: Arc::new(columns),
        date_index,
        finished: false,
    })
}

impl Iterator for ReportRows<'_> {
    type Item = Result<ReportRow, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let record = match self.records.next()? {
            Ok(record) => record,
            Err(err) => {
                self.finished = true;
                return Some(Err(err.into()));
            }
        };

        let line = record.position().map(|p| p.line()).unwrap_or_default();

        if record.get(self.date_index).map(str::trim).unwrap_or("").is_empty() {
            debug!("Reached report summary at line {}, stopping", line);
            self.finished = true;
            return None;
        }

        Some(Ok(ReportRow {
            line,
            record,
            columns: Arc::clone(&self.columns),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
Date,Line Item ID,Line Item,Impressions,Media Cost (Advertiser Currency)
2023/01/05,42,Spring Sale,1200,\"1,234.50\"
2023/01/05,43,Brand,300,PLN10.00
,,,1500,1244.50
Report Time:,2023/01/06 03:00,,,
2023/01/07,44,Looks Like Data,1,1.00
";

    fn rows(bytes: &[u8]) -> Vec<ReportRow> {
        parse_rows(bytes, "Date", &["Line Item ID"])
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_stops_at_summary_row() {
        let rows = rows(REPORT.as_bytes());

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Line Item ID").unwrap(), "42");
        assert_eq!(rows[1].get("Line Item ID").unwrap(), "43");
    }

    #[test]
    fn test_reads_to_end_without_summary() {
        let report = "Date,Line Item ID\n2023-01-05,1\n2023-01-06,2\n";
        assert_eq!(rows(report.as_bytes()).len(), 2);
    }

    #[test]
    fn test_short_summary_row_stops() {
        let report = "Line Item ID,Clicks,Date\n1,2,2023-01-05\nTotal\n3,4,2023-01-06\n";
        let rows = rows(report.as_bytes());
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_typed_accessors() {
        let rows = rows(REPORT.as_bytes());
        let row = &rows[0];

        assert_eq!(row.line(), 2);
        assert_eq!(
            row.date("Date").unwrap(),
            NaiveDate::from_ymd_opt(2023, 1, 5).unwrap()
        );
        assert_eq!(row.id("Line Item ID").unwrap(), 42);
        assert_eq!(row.count("Impressions").unwrap(), 1200);
        assert_eq!(
            row.amount("Media Cost (Advertiser Currency)").unwrap(),
            Decimal::new(123450, 2)
        );
    }

    #[test]
    fn test_invalid_field_reports_line_and_column() {
        let report = "Date,Line Item ID,Clicks\n2023-01-05,42,many\n";
        let rows = rows(report.as_bytes());

        match rows[0].count("Clicks") {
            Err(Error::InvalidField {
                line,
                column,
                source,
            }) => {
                assert_eq!(line, 2);
                assert_eq!(column, "Clicks");
                assert!(matches!(*source, Error::InvalidCount { .. }));
            }
            other => panic!("Expected InvalidField error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_column() {
        let rows = rows(REPORT.as_bytes());
        assert!(matches!(
            rows[0].get("Clicks").unwrap_err(),
            Error::MissingColumn { column } if column == "Clicks"
        ));
    }

    #[test]
    fn test_missing_required_header() {
        let result = parse_rows(REPORT.as_bytes(), "Date", &["Line Item ID", "Clicks"]);
        assert!(matches!(
            result.err().unwrap(),
            Error::MissingColumn { column } if column == "Clicks"
        ));
    }

    #[test]
    fn test_missing_date_header() {
        let result = parse_rows("Line Item ID\n1\n".as_bytes(), "Date", &[]);
        assert!(matches!(
            result.err().unwrap(),
            Error::MissingColumn { column } if column == "Date"
        ));
    }

    #[test]
    fn test_header_only_report() {
        assert!(rows("Date,Line Item ID\n".as_bytes()).is_empty());
    }
}
