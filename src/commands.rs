use crate::api_client::{ApiClient, DateRange, QuerySummary, ReportApi, ReportStatus, RunQueryRequest};
use crate::config::Config;
use crate::error::Error;
use crate::layout::ReportKind;
use crate::runner::Pipeline;
use crate::store::{MemoryStore, PgStore, ReportStore};
use chrono::{NaiveDate, Utc};
use log::info;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

fn store_for(config: &Config, dry_run: bool) -> Result<Arc<dyn ReportStore>, Error> {
    if dry_run {
        info!("Dry run, rows are kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }
    Ok(Arc::new(PgStore::new(config.db_uri()?)?))
}

/// Runs the scheduled query of a report type and loads its result.
pub async fn run_report(config: &Config, kind: ReportKind, dry_run: bool) -> Result<(), Error> {
    let query_id = config.query_id(kind)?;
    let timezone = config.timezone()?;
    let store = store_for(config, dry_run)?;
    let api = Arc::new(ApiClient::from_config(config)?);

    let today = Utc::now().with_timezone(&timezone).date_naive();
    let request = kind.scheduled_request(today, timezone)?;

    let mut pipeline = Pipeline::new(api, store, kind.layout(), config.poll_interval(kind))
        .with_max_poll_attempts(config.max_poll_attempts);
    pipeline.run(query_id, &request).await?;

    Ok(())
}

/// Loads a report file previously saved by [`download`].
pub async fn save_report(
    config: &Config,
    query_id: i64,
    kind: ReportKind,
    dry_run: bool,
) -> Result<(), Error> {
    let store = store_for(config, dry_run)?;
    let api = Arc::new(ApiClient::from_config(config)?);
    let path = config.report_path(query_id);

    info!("Loading {} into {}", path.display(), kind.layout().name);
    let bytes = tokio::fs::read(&path).await?;

    let mut pipeline = Pipeline::new(api, store, kind.layout(), config.poll_interval(kind));
    pipeline.load(&bytes).await?;

    Ok(())
}

pub fn format_query_table(queries: &[QuerySummary]) -> Vec<String> {
    let mut lines = vec!["Query ID | Name | Data Range | Last run date | Is running?".to_string()];
    lines.extend(queries.iter().map(|q| {
        let last_run = q
            .latest_report_run
            .map(|run| run.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        format!(
            "{} | {} | {} | {} | {}",
            q.query_id, q.title, q.data_range, last_run, q.running
        )
    }));
    lines
}

pub async fn list(api: &impl ReportApi) -> Result<(), Error> {
    match api.list_queries().await {
        Ok(queries) => {
            for line in format_query_table(&queries) {
                println!("{}", line);
            }
            Ok(())
        }
        Err(Error::NoData { message }) => {
            println!("{}", message);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Saves the latest report of a query as `<reports dir>/<query id>.csv`.
pub async fn download(api: &impl ReportApi, config: &Config, query_id: i64) -> Result<(), Error> {
    info!("Downloading Query {}", query_id);

    let location = match api.report_status(query_id).await? {
        ReportStatus::Ready(location) => location,
        ReportStatus::Running => return Err(Error::QueryRunning { query_id }),
    };
    let bytes = api.fetch_report(&location).await?;

    let path = config.report_path(query_id);
    save_file(&path, &bytes).await?;
    info!("Saved {}", path.display());

    Ok(())
}

async fn save_file(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

pub async fn run_query(
    api: &impl ReportApi,
    config: &Config,
    query_id: i64,
    date_range: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<(), Error> {
    let request = RunQueryRequest::new(DateRange::from_str(date_range)?, start, end, config.timezone()?)?;
    api.run_query(query_id, &request).await?;
    info!("Query {} is running", query_id);
    Ok(())
}

/// Reads a JSON query definition.
pub async fn read_query_spec(path: &Path) -> Result<serde_json::Value, Error> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content)
        .map_err(|_| Error::invalid_argument(format!("{} is not a json file", path.display())))
}

pub async fn create_query(api: &impl ReportApi, spec_file: &Path) -> Result<(), Error> {
    let spec = read_query_spec(spec_file).await?;
    let query_id = api.create_query(&spec).await?;
    info!("Created Query ID {}", query_id);
    Ok(())
}

pub async fn remove_queries(api: &impl ReportApi, query_ids: &[i64]) -> Result<(), Error> {
    for query_id in query_ids {
        api.delete_query(*query_id).await?;
        info!("Removed Query ID {}", query_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::MockReportApi;
    use crate::config::tests::test_config;
    use chrono::DateTime;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_format_query_table() {
        let queries = vec![QuerySummary {
            query_id: 1001,
            title: "Basic stats".to_string(),
            data_range: "PREVIOUS_DAY".to_string(),
            latest_report_run: DateTime::from_timestamp_millis(1672873200000),
            running: false,
        }];

        let lines = format_query_table(&queries);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "1001 | Basic stats | PREVIOUS_DAY | 2023-01-04 23:00:00 | false"
        );
    }

    #[tokio::test]
    async fn test_list_without_queries_is_not_an_error() {
        let mut api = MockReportApi::new();
        api.expect_list_queries().returning(|| {
            Err(Error::NoData {
                message: "No queries are created for this account.".to_string(),
            })
        });

        assert!(list(&api).await.is_ok());
    }

    #[tokio::test]
    async fn test_download_saves_report() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.reports_dir = dir.path().join("reports");

        let mut api = MockReportApi::new();
        api.expect_report_status()
            .returning(|_| Ok(ReportStatus::Ready("https://storage/42.csv".to_string())));
        api.expect_fetch_report()
            .withf(|location| location == "https://storage/42.csv")
            .returning(|_| Ok(b"Date,Line Item ID\n".to_vec()));

        download(&api, &config, 42).await.unwrap();

        let saved = std::fs::read(config.report_path(42)).unwrap();
        assert_eq!(saved, b"Date,Line Item ID\n");
    }

    #[tokio::test]
    async fn test_download_running_query() {
        let mut api = MockReportApi::new();
        api.expect_report_status()
            .returning(|_| Ok(ReportStatus::Running));
        api.expect_fetch_report().never();

        let result = download(&api, &test_config(), 42).await;
        assert!(matches!(result.unwrap_err(), Error::QueryRunning { query_id: 42 }));
    }

    #[tokio::test]
    async fn test_run_query_rejects_unknown_range() {
        let mut api = MockReportApi::new();
        api.expect_run_query().never();

        let result = run_query(&api, &test_config(), 42, "YESTERDAY", None, None).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_run_query_custom_dates() {
        let mut api = MockReportApi::new();
        api.expect_run_query()
            .withf(|query_id, request| *query_id == 42 && request.data_range() == DateRange::CustomDates)
            .times(1)
            .returning(|_, _| Ok(()));

        let day = NaiveDate::from_ymd_opt(2023, 1, 5);
        run_query(&api, &test_config(), 42, "CUSTOM_DATES", day, day)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_query_rejects_non_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "dataRange: PREVIOUS_DAY").unwrap();

        let mut api = MockReportApi::new();
        api.expect_create_query().never();

        let result = create_query(&api, file.path()).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_create_query_missing_file() {
        let api = MockReportApi::new();
        let result = create_query(&api, Path::new("/nonexistent/query.json")).await;
        assert!(matches!(result.unwrap_err(), Error::Io(_)));
    }

    #[tokio::test]
    async fn test_create_query() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"metadata": {{"title": "Basic stats"}}}}"#).unwrap();

        let mut api = MockReportApi::new();
        api.expect_create_query()
            .withf(|spec| spec["metadata"]["title"] == "Basic stats")
            .times(1)
            .returning(|_| Ok(1001));

        create_query(&api, file.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_queries() {
        let mut api = MockReportApi::new();
        api.expect_delete_query().times(2).returning(|_| Ok(()));

        remove_queries(&api, &[1, 2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_report_requires_db_uri() {
        let result = save_report(&test_config(), 42, ReportKind::BasicStats, false).await;
        assert!(matches!(
            result.err().unwrap(),
            Error::Configuration { message } if message == "DB_URI is not set"
        ));
    }
}
