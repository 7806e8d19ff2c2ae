use crate::auth::{Credentials, ServiceAccountKey};
use crate::config::Config;
use crate::error::Error;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, info};
use reqwest::{header::AUTHORIZATION, Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ReportApi: Send + Sync + 'static {
    /// Starts a run of an existing query for the given date range.
    async fn run_query(&self, query_id: i64, request: &RunQueryRequest) -> Result<(), Error>;

    /// Looks up where the latest report of a query can be downloaded from.
    /// # Returns
    /// [`ReportStatus::Running`] while the query is still computing,
    /// [`ReportStatus::Ready`] with the file location once it is done, or
    /// [`Error::QueryNotFound`] when the query does not exist or never ran.
    async fn report_status(&self, query_id: i64) -> Result<ReportStatus, Error>;

    /// Downloads a finished report file. Failures are not retried here.
    async fn fetch_report(&self, location: &str) -> Result<Vec<u8>, Error>;

    /// Lists the queries configured for the account.
    /// # Returns
    /// [`Error::NoData`] when the account has no queries.
    async fn list_queries(&self) -> Result<Vec<QuerySummary>, Error>;

    /// Creates a query from a JSON query definition and returns its ID.
    async fn create_query(&self, spec: &serde_json::Value) -> Result<i64, Error>;

    /// Deletes a query together with its reports.
    async fn delete_query(&self, query_id: i64) -> Result<(), Error>;
}

/// Predefined report date ranges understood by DBM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRange {
    AllTime,
    CurrentDay,
    CustomDates,
    Last14Days,
    Last30Days,
    Last365Days,
    Last7Days,
    Last90Days,
    MonthToDate,
    PreviousDay,
    PreviousHalfMonth,
    PreviousMonth,
    PreviousQuarter,
    PreviousWeek,
    PreviousYear,
    QuarterToDate,
    TypeNotSupported,
    WeekToDate,
    YearToDate,
}

impl DateRange {
    pub const ALL: [DateRange; 19] = [
        DateRange::AllTime,
        DateRange::CurrentDay,
        DateRange::CustomDates,
        DateRange::Last14Days,
        DateRange::Last30Days,
        DateRange::Last365Days,
        DateRange::Last7Days,
        DateRange::Last90Days,
        DateRange::MonthToDate,
        DateRange::PreviousDay,
        DateRange::PreviousHalfMonth,
        DateRange::PreviousMonth,
        DateRange::PreviousQuarter,
        DateRange::PreviousWeek,
        DateRange::PreviousYear,
        DateRange::QuarterToDate,
        DateRange::TypeNotSupported,
        DateRange::WeekToDate,
        DateRange::YearToDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DateRange::AllTime => "ALL_TIME",
            DateRange::CurrentDay => "CURRENT_DAY",
            DateRange::CustomDates => "CUSTOM_DATES",
            DateRange::Last14Days => "LAST_14_DAYS",
            DateRange::Last30Days => "LAST_30_DAYS",
            DateRange::Last365Days => "LAST_365_DAYS",
            DateRange::Last7Days => "LAST_7_DAYS",
            DateRange::Last90Days => "LAST_90_DAYS",
            DateRange::MonthToDate => "MONTH_TO_DATE",
            DateRange::PreviousDay => "PREVIOUS_DAY",
            DateRange::PreviousHalfMonth => "PREVIOUS_HALF_MONTH",
            DateRange::PreviousMonth => "PREVIOUS_MONTH",
            DateRange::PreviousQuarter => "PREVIOUS_QUARTER",
            DateRange::PreviousWeek => "PREVIOUS_WEEK",
            DateRange::PreviousYear => "PREVIOUS_YEAR",
            DateRange::QuarterToDate => "QUARTER_TO_DATE",
            DateRange::TypeNotSupported => "TYPE_NOT_SUPPORTED",
            DateRange::WeekToDate => "WEEK_TO_DATE",
            DateRange::YearToDate => "YEAR_TO_DATE",
        }
    }
}

impl FromStr for DateRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DateRange::ALL
            .iter()
            .copied()
            .find(|range| range.as_str() == s)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "{} is not within approved date ranges. \
                     Check https://developers.google.com/bid-manager/v1/queries for more information",
                    s
                ))
            })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DateRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Body of a `runquery` call.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunQueryRequest {
    data_range: DateRange,
    timezone_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_data_start_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_data_end_time_ms: Option<i64>,
}

impl RunQueryRequest {
    /// Builds a run request, validating custom date boundaries.
    ///
    /// For [`DateRange::CustomDates`] both dates are required and are sent as
    /// midnight of that day in `timezone`, in epoch milliseconds. Dates given
    /// with any other range are ignored.
    pub fn new(
        data_range: DateRange,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        timezone: Tz,
    ) -> Result<Self, Error> {
        let (start_ms, end_ms) = match (data_range, start, end) {
            (DateRange::CustomDates, Some(start), Some(end)) => {
                if start > end {
                    return Err(Error::invalid_argument(format!(
                        "The start date: '{}' is greater than the end date: '{}'",
                        start, end
                    )));
                }
                (
                    Some(local_midnight_ms(start, timezone)?),
                    Some(local_midnight_ms(end, timezone)?),
                )
            }
            (DateRange::CustomDates, _, _) => {
                return Err(Error::invalid_argument(
                    "CUSTOM_DATES requires both a start and an end date",
                ))
            }
            _ => (None, None),
        };

        Ok(RunQueryRequest {
            data_range,
            timezone_code: timezone.name().to_string(),
            report_data_start_time_ms: start_ms,
            report_data_end_time_ms: end_ms,
        })
    }

    pub fn data_range(&self) -> DateRange {
        self.data_range
    }
}

fn local_midnight_ms(date: NaiveDate, timezone: Tz) -> Result<i64, Error> {
    timezone
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .map(|local| local.timestamp_millis())
        .ok_or_else(|| {
            Error::invalid_argument(format!("{} has no midnight in {}", date, timezone.name()))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    Running,
    Ready(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySummary {
    pub query_id: i64,
    pub title: String,
    pub data_range: String,
    pub latest_report_run: Option<DateTime<Utc>>,
    pub running: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct QueryResource {
    #[serde(default, deserialize_with = "de_int64")]
    query_id: Option<i64>,
    #[serde(default)]
    metadata: Option<QueryMetadata>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct QueryMetadata {
    #[serde(default)]
    title: String,
    #[serde(default)]
    data_range: String,
    #[serde(default, deserialize_with = "de_int64")]
    latest_report_run_time_ms: Option<i64>,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    google_cloud_storage_path_for_latest_report: Option<String>,
}

#[derive(Deserialize)]
struct Queries {
    #[serde(default)]
    queries: Vec<QueryResource>,
}

// DBM encodes int64 fields as JSON strings.
fn de_int64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("{} is not an int64", n))),
        Some(serde_json::Value::String(s)) => s.parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("{} is not an int64", other))),
    }
}

fn status_of(query_id: i64, query: QueryResource) -> Result<ReportStatus, Error> {
    let metadata = query.metadata.ok_or(Error::QueryNotFound { query_id })?;

    if metadata.running {
        return Ok(ReportStatus::Running);
    }

    match metadata.google_cloud_storage_path_for_latest_report {
        Some(path) if !path.is_empty() => Ok(ReportStatus::Ready(path)),
        _ => Err(Error::QueryNotFound { query_id }),
    }
}

fn summary_of(query: QueryResource) -> Option<QuerySummary> {
    let query_id = query.query_id?;
    let metadata = query.metadata.unwrap_or_default();

    Some(QuerySummary {
        query_id,
        title: metadata.title,
        data_range: metadata.data_range,
        latest_report_run: metadata
            .latest_report_run_time_ms
            .and_then(DateTime::from_timestamp_millis),
        running: metadata.running,
    })
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Arc<Credentials>,
}

impl ApiClient {
    pub fn new(base_url: &str, credentials: Credentials) -> Self {
        ApiClient {
            client: Client::new(),
            base_url: base_url.to_string(),
            credentials: Arc::new(credentials),
        }
    }

    /// Builds a client authorized with the configured service-account key.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let key = ServiceAccountKey::from_file(&config.api_key_file)?;
        Ok(Self::new(&config.api_url, Credentials::service_account(key)))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, Error> {
        let token = self.credentials.bearer(&self.client).await?;
        Ok(request
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?)
    }
}

#[async_trait::async_trait]
impl ReportApi for ApiClient {
    async fn run_query(&self, query_id: i64, request: &RunQueryRequest) -> Result<(), Error> {
        let url = self.endpoint(&["query", &query_id.to_string()])?;
        info!("Running query {} with range {}", query_id, request.data_range);

        self.send(self.client.post(url).json(request))
            .await?
            .error_for_status()?;

        Ok(())
    }

    async fn report_status(&self, query_id: i64) -> Result<ReportStatus, Error> {
        let url = self.endpoint(&["query", &query_id.to_string()])?;

        let resp = self.send(self.client.get(url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::QueryNotFound { query_id });
        }

        let body = resp.error_for_status()?.text().await?;
        if body.trim().is_empty() {
            return Err(Error::QueryNotFound { query_id });
        }

        status_of(query_id, serde_json::from_str(&body)?)
    }

    async fn fetch_report(&self, location: &str) -> Result<Vec<u8>, Error> {
        debug!("Downloading report from {}", location);
        let url = Url::parse(location)?;

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        Ok(bytes.to_vec())
    }

    async fn list_queries(&self) -> Result<Vec<QuerySummary>, Error> {
        let url = self.endpoint(&["queries"])?;

        let queries: Queries = self
            .send(self.client.get(url))
            .await?
            .error_for_status()?
            .json()
            .await?;

        let summaries: Vec<QuerySummary> =
            queries.queries.into_iter().filter_map(summary_of).collect();

        if summaries.is_empty() {
            return Err(Error::NoData {
                message: "No queries are created for this account. Use create-query to create new one."
                    .to_string(),
            });
        }

        Ok(summaries)
    }

    async fn create_query(&self, spec: &serde_json::Value) -> Result<i64, Error> {
        let url = self.endpoint(&["query"])?;

        let created: QueryResource = self
            .send(self.client.post(url).json(spec))
            .await?
            .error_for_status()?
            .json()
            .await?;

        created.query_id.ok_or_else(|| Error::NoData {
            message: "DBM did not return an ID for the created query".to_string(),
        })
    }

    async fn delete_query(&self, query_id: i64) -> Result<(), Error> {
        let url = self.endpoint(&["query", &query_id.to_string()])?;

        self.send(self.client.delete(url))
            .await?
            .error_for_status()?;

        Ok(())
    }
}
