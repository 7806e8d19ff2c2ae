use crate::error::Error;
use crate::layout::ReportKind;
use chrono_tz::Tz;
use clap::Args as ClapArgs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://www.googleapis.com/doubleclickbidmanager/v1";
const DEFAULT_TIMEZONE: &str = "America/New_York";
const REPORTS_DIR: &str = "./reports";

#[derive(ClapArgs, Debug, Clone)]
pub struct Config {
    /// Path to the service-account key (JSON)
    #[arg(long, env = "API_KEY_FILE")]
    pub(crate) api_key_file: PathBuf,

    #[arg(long, default_value = DEFAULT_API_URL, env = "DBM_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, env = "DB_URI")]
    pub(crate) db_uri: Option<String>,

    /// Canonical timezone code used for report date ranges
    #[arg(long, default_value = DEFAULT_TIMEZONE, env = "DBM_TIMEZONE")]
    pub(crate) timezone: String,

    #[arg(long, env = "QUERY_BASIC_STATS")]
    pub(crate) query_basic_stats: Option<i64>,

    #[arg(long, env = "QUERY_CONVERSION_STATS")]
    pub(crate) query_conversion_stats: Option<i64>,

    #[arg(long, default_value = REPORTS_DIR, env = "REPORTS_DIR")]
    pub(crate) reports_dir: PathBuf,

    /// Seconds between report status checks; defaults to the report type's interval
    #[arg(long, env = "POLL_INTERVAL_SECS")]
    pub(crate) poll_interval_secs: Option<u64>,

    /// Give up after this many status checks; unlimited when unset
    #[arg(long, env = "MAX_POLL_ATTEMPTS", value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) max_poll_attempts: Option<u32>,
}

impl Config {
    pub fn timezone(&self) -> Result<Tz, Error> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| Error::configuration(format!("{} is not a known timezone", self.timezone)))
    }

    pub fn db_uri(&self) -> Result<&str, Error> {
        self.db_uri
            .as_deref()
            .ok_or_else(|| Error::configuration("DB_URI is not set"))
    }

    pub fn query_id(&self, kind: ReportKind) -> Result<i64, Error> {
        let (query_id, variable) = match kind {
            ReportKind::BasicStats => (self.query_basic_stats, "QUERY_BASIC_STATS"),
            ReportKind::ConversionStats => (self.query_conversion_stats, "QUERY_CONVERSION_STATS"),
        };

        query_id.ok_or_else(|| Error::configuration(format!("{} is not set", variable)))
    }

    pub fn poll_interval(&self, kind: ReportKind) -> Duration {
        self.poll_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.layout().poll_interval)
    }

    pub fn report_path(&self, query_id: i64) -> PathBuf {
        self.reports_dir.join(format!("{}.csv", query_id))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config {
            api_key_file: PathBuf::from("/path/to/key.json"),
            api_url: DEFAULT_API_URL.to_string(),
            db_uri: None,
            timezone: "Europe/Warsaw".to_string(),
            query_basic_stats: Some(1001),
            query_conversion_stats: None,
            reports_dir: PathBuf::from("/path/to/reports"),
            poll_interval_secs: None,
            max_poll_attempts: None,
        }
    }

    #[test]
    fn test_timezone() {
        let mut config = test_config();
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Warsaw);

        config.timezone = "Mars/Olympus".to_string();
        assert!(matches!(
            config.timezone().unwrap_err(),
            Error::Configuration { .. }
        ));
    }

    #[test]
    fn test_missing_values_are_configuration_errors() {
        let config = test_config();
        assert!(matches!(config.db_uri().unwrap_err(), Error::Configuration { .. }));
        assert!(matches!(
            config.query_id(ReportKind::ConversionStats).unwrap_err(),
            Error::Configuration { message } if message == "QUERY_CONVERSION_STATS is not set"
        ));
        assert_eq!(config.query_id(ReportKind::BasicStats).unwrap(), 1001);
    }

    #[test]
    fn test_poll_interval() {
        let mut config = test_config();
        assert_eq!(
            config.poll_interval(ReportKind::BasicStats),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.poll_interval(ReportKind::ConversionStats),
            Duration::from_secs(30)
        );

        config.poll_interval_secs = Some(5);
        assert_eq!(
            config.poll_interval(ReportKind::BasicStats),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_report_path() {
        let config = test_config();
        assert_eq!(
            config.report_path(42),
            PathBuf::from("/path/to/reports/42.csv")
        );
    }
}
