//! Test run state polling.
//!
//! A run is either still in progress (no exit code) or terminal. The
//! [`StateChecker`] polls the service at the pace the service asks for
//! (`waitTime`, at least one second) and, when given a non-zero timeout,
//! stops before a sleep that would overrun it.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | All tests passed |
//! | 1-63 | Reported by the service (1 = test failures, 2 = cannot run tests) |
//! | [`TIMEOUT_EXIT_CODE`] | Gave up waiting |

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::progress::{NullProgress, Progress};
use crate::service::{ServiceResult, TestService};

/// Exit code returned when polling stops on the timeout budget.
///
/// Outside the 1-63 range the service uses, and the same value `timeout(1)`
/// uses.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Shortest pause between two polls of an unfinished run.
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Service-reported exit code for a run with failing tests.
pub const TEST_FAILURES_EXIT_CODE: i32 = 1;

/// Service-reported exit code for a run that could not execute.
pub const CANNOT_RUN_EXIT_CODE: i32 = 2;

/// One poll result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    #[serde(default)]
    pub message: Vec<String>,
    /// Seconds to wait before the next poll.
    #[serde(default)]
    pub wait_time: u64,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Polls one test run until it reaches a terminal state.
pub struct StateChecker<'a, S: TestService> {
    service: &'a S,
    test_run_id: String,
    progress: Arc<dyn Progress>,
}

impl<'a, S: TestService> StateChecker<'a, S> {
    pub fn new(service: &'a S, test_run_id: impl Into<String>) -> Self {
        Self {
            service,
            test_run_id: test_run_id.into(),
            progress: Arc::new(NullProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn test_run_id(&self) -> &str {
        &self.test_run_id
    }

    /// Queries the state exactly once and reports its status lines.
    pub async fn check_once(&self) -> ServiceResult<RunState> {
        let state = self.service.get_test_run_state(&self.test_run_id).await?;
        if !state.message.is_empty() {
            self.progress.status(&state.message);
        }
        Ok(state)
    }

    /// Polls until the run is terminal and returns its exit code.
    ///
    /// With `timeout_secs`, the elapsed time plus the next wait is checked
    /// before every sleep; if it would exceed the budget the loop ends and
    /// [`TIMEOUT_EXIT_CODE`] is returned instead of sleeping. A timeout of
    /// zero means no timeout.
    pub async fn check_until_completed(&self, timeout_secs: Option<u64>) -> ServiceResult<i32> {
        let start = Instant::now();
        let timeout_secs = timeout_secs.filter(|&secs| secs > 0);

        loop {
            let state = self.check_once().await?;

            if let Some(exit_code) = state.exit_code {
                info!("Test run {} finished with exit code {}", self.test_run_id, exit_code);
                return Ok(exit_code);
            }

            let wait_time = state.wait_time.max(MIN_POLL_INTERVAL_SECS);
            if let Some(timeout) = timeout_secs {
                let elapsed = start.elapsed().as_secs_f64();
                if elapsed + wait_time as f64 > timeout as f64 {
                    info!(
                        "Timed out waiting for test run {} after {:.1}s",
                        self.test_run_id, elapsed
                    );
                    self.progress.timed_out(timeout);
                    return Ok(TIMEOUT_EXIT_CODE);
                }
            }

            debug!("Test run {} in progress, waiting {}s", self.test_run_id, wait_time);
            self.progress.waiting(wait_time);
            tokio::time::sleep(Duration::from_secs(wait_time)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::TestRunFile;
    use crate::service::{ServiceError, StartRunOptions, StartRunResult};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed sequence of states; the last one repeats forever.
    struct ScriptedService {
        states: Mutex<VecDeque<RunState>>,
        polls: AtomicUsize,
    }

    impl ScriptedService {
        fn new(states: Vec<RunState>) -> Self {
            Self {
                states: Mutex::new(states.into()),
                polls: AtomicUsize::new(0),
            }
        }
    }

    fn running(wait_time: u64) -> RunState {
        RunState {
            message: vec!["Running on 2 devices".to_string()],
            wait_time,
            exit_code: None,
        }
    }

    fn finished(exit_code: i32) -> RunState {
        RunState {
            message: vec!["Done".to_string()],
            wait_time: 0,
            exit_code: Some(exit_code),
        }
    }

    #[async_trait]
    impl TestService for ScriptedService {
        async fn create_test_run(&self) -> ServiceResult<String> {
            unimplemented!()
        }
        async fn upload_by_hash(&self, _: &str, _: &TestRunFile) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn request_direct_upload_url(&self, _: &str) -> ServiceResult<String> {
            unimplemented!()
        }
        async fn upload_file(&self, _: &str, _: &TestRunFile) -> ServiceResult<()> {
            unimplemented!()
        }
        async fn start_test_run(&self, _: &str, _: &StartRunOptions) -> ServiceResult<StartRunResult> {
            unimplemented!()
        }
        async fn get_test_run_state(&self, test_run_id: &str) -> ServiceResult<RunState> {
            if test_run_id == "missing" {
                return Err(ServiceError::NotFound);
            }
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut states = self.states.lock().unwrap();
            if states.len() > 1 {
                Ok(states.pop_front().unwrap())
            } else {
                Ok(states.front().cloned().unwrap())
            }
        }
        async fn get_report_artifacts(&self, _: &str) -> ServiceResult<HashMap<String, String>> {
            unimplemented!()
        }
        async fn download_artifact(&self, _: &str, _: &Path) -> ServiceResult<()> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        statuses: Mutex<Vec<String>>,
        waits: Mutex<Vec<u64>>,
        timeouts: Mutex<Vec<u64>>,
    }

    impl Progress for RecordingProgress {
        fn status(&self, lines: &[String]) {
            self.statuses.lock().unwrap().extend(lines.iter().cloned());
        }
        fn waiting(&self, seconds: u64) {
            self.waits.lock().unwrap().push(seconds);
        }
        fn timed_out(&self, timeout_secs: u64) {
            self.timeouts.lock().unwrap().push(timeout_secs);
        }
    }

    #[test]
    fn test_run_state_wire_format() {
        let state: RunState =
            serde_json::from_str(r#"{ "message": ["a", "b"], "waitTime": 15 }"#).unwrap();
        assert_eq!(state.wait_time, 15);
        assert!(!state.is_terminal());

        let state: RunState = serde_json::from_str(r#"{ "message": [], "waitTime": 0, "exitCode": 0 }"#).unwrap();
        assert!(state.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_once_does_not_wait() {
        let service = ScriptedService::new(vec![running(30)]);
        let checker = StateChecker::new(&service, "run-1");

        let before = Instant::now();
        let state = checker.check_once().await.unwrap();

        assert!(!state.is_terminal());
        assert_eq!(service.polls.load(Ordering::SeqCst), 1);
        assert!(before.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_terminal() {
        let service = ScriptedService::new(vec![running(10), running(5), finished(1)]);
        let progress = Arc::new(RecordingProgress::default());
        let checker = StateChecker::new(&service, "run-1").with_progress(progress.clone());

        let before = Instant::now();
        let exit_code = checker.check_until_completed(None).await.unwrap();

        assert_eq!(exit_code, 1);
        assert_eq!(service.polls.load(Ordering::SeqCst), 3);
        assert_eq!(*progress.waits.lock().unwrap(), vec![10, 5]);
        assert_eq!(before.elapsed().as_secs(), 15);
        assert_eq!(progress.statuses.lock().unwrap().last().unwrap(), "Done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_oversleeps() {
        let service = ScriptedService::new(vec![running(10)]);
        let progress = Arc::new(RecordingProgress::default());
        let checker = StateChecker::new(&service, "run-1").with_progress(progress.clone());

        let before = Instant::now();
        let exit_code = checker.check_until_completed(Some(25)).await.unwrap();

        assert_eq!(exit_code, TIMEOUT_EXIT_CODE);
        // Slept at 0s and 10s; a third sleep would end at 30s > 25s.
        assert_eq!(before.elapsed().as_secs(), 20);
        assert_eq!(service.polls.load(Ordering::SeqCst), 3);
        assert_eq!(*progress.timeouts.lock().unwrap(), vec![25]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_first_wait() {
        let service = ScriptedService::new(vec![running(60)]);
        let checker = StateChecker::new(&service, "run-1");

        let exit_code = checker.check_until_completed(Some(30)).await.unwrap();
        assert_eq!(exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(service.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_state_wins_over_timeout() {
        let service = ScriptedService::new(vec![finished(0)]);
        let checker = StateChecker::new(&service, "run-1");

        assert_eq!(checker.check_until_completed(Some(0)).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_wait_time_still_pauses() {
        let service = ScriptedService::new(vec![running(0), running(0), finished(0)]);
        let progress = Arc::new(RecordingProgress::default());
        let checker = StateChecker::new(&service, "run-1").with_progress(progress.clone());

        let before = Instant::now();
        assert_eq!(checker.check_until_completed(None).await.unwrap(), 0);

        assert_eq!(before.elapsed().as_secs(), 2);
        assert_eq!(*progress.waits.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_waits_for_completion() {
        let service = ScriptedService::new(vec![running(10), finished(1)]);
        let checker = StateChecker::new(&service, "run-1");

        assert_eq!(checker.check_until_completed(Some(0)).await.unwrap(), 1);
        assert_eq!(service.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_service_errors_propagate() {
        let service = ScriptedService::new(vec![running(1)]);
        let checker = StateChecker::new(&service, "missing");

        assert!(matches!(
            checker.check_until_completed(None).await,
            Err(ServiceError::NotFound)
        ));
    }
}
