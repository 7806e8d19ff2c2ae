use crate::api_client::{ReportApi, ReportStatus, RunQueryRequest};
use crate::error::Error;
use crate::layout::ReportLayout;
use crate::mapper;
use crate::report;
use crate::store::{CommitSummary, ReportStore};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Submitted,
    Polling,
    Downloaded,
    Persisting,
    Done,
    Failed,
}

/// Loads one report type: run the query, wait for it, download the CSV and
/// commit its rows.
pub struct Pipeline<A, S: ?Sized> {
    api: Arc<A>,
    store: Arc<S>,
    layout: &'static ReportLayout,
    poll_interval: Duration,
    max_poll_attempts: Option<u32>,
    state: PipelineState,
}

impl<A: ReportApi, S: ReportStore + ?Sized> Pipeline<A, S> {
    pub fn new(
        api: Arc<A>,
        store: Arc<S>,
        layout: &'static ReportLayout,
        poll_interval: Duration,
    ) -> Self {
        Pipeline {
            api,
            store,
            layout,
            poll_interval,
            max_poll_attempts: None,
            state: PipelineState::Idle,
        }
    }

    /// Limits how many status checks are made; unlimited by default.
    pub fn with_max_poll_attempts(mut self, max_poll_attempts: Option<u32>) -> Self {
        self.max_poll_attempts = max_poll_attempts;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Runs `query_id` for `request` and loads the resulting report.
    pub async fn run(
        &mut self,
        query_id: i64,
        request: &RunQueryRequest,
    ) -> Result<CommitSummary, Error> {
        let result = self.run_inner(query_id, request).await;
        self.finish(result)
    }

    /// Loads a report that has already been downloaded.
    pub async fn load(&mut self, bytes: &[u8]) -> Result<CommitSummary, Error> {
        self.transition(PipelineState::Downloaded);
        let result = self.persist(bytes).await;
        self.finish(result)
    }

    async fn run_inner(
        &mut self,
        query_id: i64,
        request: &RunQueryRequest,
    ) -> Result<CommitSummary, Error> {
        self.api.run_query(query_id, request).await?;
        self.transition(PipelineState::Submitted);

        let bytes = self.wait_for_report(query_id).await?;
        self.transition(PipelineState::Downloaded);

        self.persist(&bytes).await
    }

    async fn wait_for_report(&mut self, query_id: i64) -> Result<Vec<u8>, Error> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.api.report_status(query_id).await? {
                ReportStatus::Ready(location) => {
                    info!("Query {} finished, downloading report", query_id);
                    return self.api.fetch_report(&location).await;
                }
                ReportStatus::Running => {
                    if self.max_poll_attempts.is_some_and(|max| attempts >= max) {
                        return Err(Error::PollLimitExceeded { query_id, attempts });
                    }
                    self.transition(PipelineState::Polling);
                    info!(
                        "Query {} is still running, waiting {}s",
                        query_id,
                        self.poll_interval.as_secs()
                    );
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn persist(&mut self, bytes: &[u8]) -> Result<CommitSummary, Error> {
        let layout = self.layout;
        let rows = report::parse_rows(bytes, layout.date_column, &layout.required_headers())?;

        self.store.ensure_schema(layout).await?;
        let known_ids = self.store.dimension_ids(layout).await?;
        let batch = mapper::map_rows(layout, rows, known_ids)?;
        info!(
            "Mapped {} rows of {} ({} aggregate rows skipped)",
            batch.facts.len(),
            layout.name,
            batch.skipped_rows
        );

        self.transition(PipelineState::Persisting);
        let summary = self.store.commit(layout, &batch).await?;
        info!(
            "Committed {}: {} dimensions inserted, {} updated, {} facts inserted, {} duplicates ignored",
            layout.name,
            summary.dimensions_inserted,
            summary.dimensions_updated,
            summary.facts_inserted,
            summary.facts_ignored
        );

        Ok(summary)
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            info!("{}: {:?} -> {:?}", self.layout.name, self.state, next);
            self.state = next;
        }
    }

    fn finish(&mut self, result: Result<CommitSummary, Error>) -> Result<CommitSummary, Error> {
        match &result {
            Ok(_) => self.transition(PipelineState::Done),
            Err(_) => self.transition(PipelineState::Failed),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{DateRange, MockReportApi};
    use crate::layout::{BASIC_STATS, CONVERSION_STATS};
    use crate::mapper::tests::{BASIC_REPORT, CONVERSION_REPORT};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    const LOCATION: &str = "https://storage.googleapis.com/reports/1001.csv";

    fn request() -> RunQueryRequest {
        RunQueryRequest::new(DateRange::PreviousDay, None, None, chrono_tz::Europe::Warsaw)
            .unwrap()
    }

    fn api_returning(report: &str, running_checks: usize) -> MockReportApi {
        let bytes = report.as_bytes().to_vec();
        let mut remaining = running_checks;
        let mut api = MockReportApi::new();

        api.expect_run_query().times(1).returning(|_, _| Ok(()));
        api.expect_report_status()
            .times(running_checks + 1)
            .returning(move |_| {
                if remaining == 0 {
                    return Ok(ReportStatus::Ready(LOCATION.to_string()));
                }
                remaining -= 1;
                Ok(ReportStatus::Running)
            });
        api.expect_fetch_report()
            .withf(|location| location == LOCATION)
            .times(1)
            .returning(move |_| Ok(bytes.clone()));

        api
    }

    #[tokio::test]
    async fn test_polls_until_report_is_ready() {
        let store = Arc::new(MemoryStore::new());
        let mut pipeline = Pipeline::new(
            Arc::new(api_returning(BASIC_REPORT, 3)),
            store.clone(),
            &BASIC_STATS,
            Duration::ZERO,
        );

        let summary = pipeline.run(1001, &request()).await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(summary.facts_inserted, 1);
        assert_eq!(summary.dimensions_inserted, 1);
    }

    #[tokio::test]
    async fn test_rerun_does_not_duplicate_facts() {
        let store = Arc::new(MemoryStore::new());

        for _ in 0..2 {
            let mut pipeline = Pipeline::new(
                Arc::new(api_returning(BASIC_REPORT, 0)),
                store.clone(),
                &BASIC_STATS,
                Duration::ZERO,
            );
            pipeline.run(1001, &request()).await.unwrap();
        }

        let facts = store.facts(&BASIC_STATS).await;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].date, NaiveDate::from_ymd_opt(2023, 1, 5).unwrap());
        assert_eq!(facts[0].entity_id, 42);

        let dimensions = store.dimensions(&BASIC_STATS).await;
        assert_eq!(dimensions.len(), 1);
        assert_eq!(dimensions[0].id, 42);
    }

    #[tokio::test]
    async fn test_second_run_updates_dimension() {
        let store = Arc::new(MemoryStore::new());

        let mut first = Pipeline::new(
            Arc::new(api_returning(CONVERSION_REPORT, 0)),
            store.clone(),
            &CONVERSION_STATS,
            Duration::ZERO,
        );
        let summary = first.run(2002, &request()).await.unwrap();
        assert_eq!(summary.dimensions_inserted, 1);
        assert_eq!(summary.dimensions_updated, 1);
        assert_eq!(summary.facts_inserted, 2);

        let mut second = Pipeline::new(
            Arc::new(api_returning(CONVERSION_REPORT, 0)),
            store.clone(),
            &CONVERSION_STATS,
            Duration::ZERO,
        );
        let summary = second.run(2002, &request()).await.unwrap();
        assert_eq!(summary.dimensions_inserted, 0);
        assert_eq!(summary.dimensions_updated, 2);
        assert_eq!(summary.facts_ignored, 2);
    }

    #[tokio::test]
    async fn test_poll_limit() {
        let mut api = MockReportApi::new();
        api.expect_run_query().returning(|_, _| Ok(()));
        api.expect_report_status()
            .times(3)
            .returning(|_| Ok(ReportStatus::Running));
        api.expect_fetch_report().never();

        let mut pipeline = Pipeline::new(
            Arc::new(api),
            Arc::new(MemoryStore::new()),
            &BASIC_STATS,
            Duration::ZERO,
        )
        .with_max_poll_attempts(Some(3));

        let result = pipeline.run(1001, &request()).await;

        assert!(matches!(
            result.unwrap_err(),
            Error::PollLimitExceeded {
                query_id: 1001,
                attempts: 3
            }
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_query_not_found_fails() {
        let mut api = MockReportApi::new();
        api.expect_run_query().returning(|_, _| Ok(()));
        api.expect_report_status()
            .returning(|query_id| Err(Error::QueryNotFound { query_id }));

        let mut pipeline = Pipeline::new(
            Arc::new(api),
            Arc::new(MemoryStore::new()),
            &BASIC_STATS,
            Duration::ZERO,
        );

        let result = pipeline.run(1001, &request()).await;

        assert!(matches!(
            result.unwrap_err(),
            Error::QueryNotFound { query_id: 1001 }
        ));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_mapping_error_commits_nothing() {
        let report = BASIC_REPORT.replace(",15,", ",fifteen,");
        let store = Arc::new(MemoryStore::new());
        let mut pipeline = Pipeline::new(
            Arc::new(api_returning(&report, 0)),
            store.clone(),
            &BASIC_STATS,
            Duration::ZERO,
        );

        let result = pipeline.run(1001, &request()).await;

        assert!(matches!(result.unwrap_err(), Error::InvalidField { .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(store.facts(&BASIC_STATS).await.is_empty());
        assert!(store.dimensions(&BASIC_STATS).await.is_empty());
    }

    #[tokio::test]
    async fn test_load_downloaded_report() {
        let store = Arc::new(MemoryStore::new());
        let mut pipeline = Pipeline::new(
            Arc::new(MockReportApi::new()),
            store.clone(),
            &CONVERSION_STATS,
            Duration::ZERO,
        );

        let summary = pipeline.load(CONVERSION_REPORT.as_bytes()).await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(summary.facts_inserted, 2);
        assert_eq!(store.dimensions(&CONVERSION_STATS).await[0].id, 900);
    }

    #[tokio::test]
    async fn test_missing_header_fails_before_writing() {
        let store = Arc::new(MemoryStore::new());
        let mut pipeline = Pipeline::new(
            Arc::new(MockReportApi::new()),
            store.clone(),
            &BASIC_STATS,
            Duration::ZERO,
        );

        let result = pipeline.load(CONVERSION_REPORT.as_bytes()).await;

        assert!(matches!(result.unwrap_err(), Error::MissingColumn { .. }));
        assert!(store.dimension_ids(&BASIC_STATS).await.unwrap().is_empty());
    }
}
