// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Submitting an archive to the notarization service and waiting for a
terminal verdict.

The remote service is opaque and reached only through its submission /
status / ticket contract. Waiting is an explicit state machine driven by
a parameterized backoff schedule, an injected clock, and a cancellation
token, so timeout and cancellation are first-class exits.
*/

use {
    crate::{archiving::SubmissionArchive, error::PipelineError},
    log::{info, warn},
    serde::Serialize,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
};

/// Status reported by the service for an in-flight submission.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServiceStatus {
    InProgress,
    Accepted,
    Rejected,
}

/// One status response from the service.
#[derive(Clone, Debug)]
pub struct StatusResponse {
    pub status: ServiceStatus,
    /// Diagnostic log attached to terminal statuses. Surfaced verbatim
    /// to callers; a rejection log names actionable problems.
    pub log: Option<String>,
}

/// Contract with the remote notarization service.
pub trait NotaryService {
    /// Submit an archive. Returns the service-assigned submission id.
    fn submit(&self, archive: &SubmissionArchive) -> Result<String, PipelineError>;

    /// Query the status of a previous submission.
    fn status(&self, submission_id: &str) -> Result<StatusResponse, PipelineError>;

    /// Fetch the notarization ticket for an accepted submission.
    fn fetch_ticket(&self, submission_id: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Client-observed lifecycle of a submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum SubmissionStatus {
    Submitted,
    Polling,
    Accepted,
    Rejected,
    TimedOut,
}

/// A submission and its terminal outcome.
///
/// The id is assigned exactly once by the service; resubmitting an
/// archive yields a new instance with a new id.
#[derive(Clone, Debug, Serialize)]
pub struct NotarizationSubmission {
    pub id: String,
    pub status: SubmissionStatus,
    pub log: Option<String>,
}

/// Exponential backoff parameters for status polling.
#[derive(Clone, Copy, Debug)]
pub struct PollConfig {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(60),
            multiplier: 1.5,
        }
    }
}

impl PollConfig {
    /// The interval following `current`. Never decreases and never
    /// exceeds the configured maximum.
    fn next_interval(&self, current: Duration) -> Duration {
        let multiplier = if self.multiplier < 1.0 {
            1.0
        } else {
            self.multiplier
        };

        current.mul_f64(multiplier).min(self.max)
    }

    fn first_interval(&self) -> Duration {
        self.base.min(self.max)
    }
}

/// Source of time, injectable so tests can drive the backoff schedule
/// deterministically.
pub trait Clock: Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// [Clock] backed by the operating system.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

pub(crate) static SYSTEM_CLOCK: SystemClock = SystemClock;

/// Cooperative cancellation flag shared between an owner and a running
/// pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Submits an archive and polls until a terminal outcome.
pub struct NotarizationClient<'a> {
    service: &'a dyn NotaryService,
    poll: PollConfig,
    timeout: Duration,
    clock: &'a dyn Clock,
    cancel: CancellationToken,
}

impl<'a> NotarizationClient<'a> {
    pub fn new(service: &'a dyn NotaryService, poll: PollConfig, timeout: Duration) -> Self {
        Self {
            service,
            poll,
            timeout,
            clock: &SYSTEM_CLOCK,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Submit `archive` and wait for a terminal status.
    ///
    /// Transient service failures are retried on the backoff schedule
    /// without disturbing submission state; fatal failures (bad
    /// credentials) abort immediately. Exceeding the overall timeout
    /// yields a `TimedOut` submission rather than an error, because the
    /// service may still be processing it.
    pub fn run(
        &self,
        archive: &SubmissionArchive,
    ) -> Result<NotarizationSubmission, PipelineError> {
        let start = self.clock.now();
        let mut interval = self.poll.first_interval();

        let id = loop {
            self.check_cancelled()?;

            match self.service.submit(archive) {
                Ok(id) => break id,
                Err(PipelineError::SubmissionTransient(reason)) => {
                    if self.clock.now().duration_since(start) >= self.timeout {
                        return Err(PipelineError::SubmissionTransient(format!(
                            "timed out retrying submission: {}",
                            reason
                        )));
                    }

                    warn!("transient error submitting archive, will retry: {}", reason);
                    interval = self.backoff(interval);
                }
                Err(error) => return Err(error),
            }
        };

        info!("submission id: {}", id);
        let mut status = SubmissionStatus::Submitted;

        loop {
            self.check_cancelled()?;

            if self.clock.now().duration_since(start) >= self.timeout {
                warn!("submission {} exceeded overall timeout", id);
                return Ok(NotarizationSubmission {
                    id,
                    status: SubmissionStatus::TimedOut,
                    log: None,
                });
            }

            match self.service.status(&id) {
                Ok(response) => match response.status {
                    ServiceStatus::InProgress => {
                        if status == SubmissionStatus::Submitted {
                            status = SubmissionStatus::Polling;
                        }
                        info!(
                            "submission {} still in progress after {}s",
                            id,
                            self.clock.now().duration_since(start).as_secs()
                        );
                    }
                    ServiceStatus::Accepted => {
                        info!("submission {} accepted", id);
                        return Ok(NotarizationSubmission {
                            id,
                            status: SubmissionStatus::Accepted,
                            log: response.log,
                        });
                    }
                    ServiceStatus::Rejected => {
                        warn!("submission {} rejected", id);
                        if let Some(log) = &response.log {
                            for line in log.lines() {
                                warn!("notarization log> {}", line);
                            }
                        }
                        return Ok(NotarizationSubmission {
                            id,
                            status: SubmissionStatus::Rejected,
                            log: response.log,
                        });
                    }
                },
                Err(PipelineError::SubmissionTransient(reason)) => {
                    warn!(
                        "transient error polling submission {}, will retry: {}",
                        id, reason
                    );
                }
                Err(error) => return Err(error),
            }

            interval = self.backoff(interval);
        }
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for the current interval, then return the next one.
    fn backoff(&self, interval: Duration) -> Duration {
        self.clock.sleep(interval);

        self.poll.next_interval(interval)
    }
}


#[cfg(test)]
mod test {
    use super::{testutil::*, *};

    fn client<'a>(
        service: &'a ScriptedService,
        clock: &'a FakeClock,
        timeout: Duration,
    ) -> NotarizationClient<'a> {
        NotarizationClient::new(
            service,
            PollConfig {
                base: Duration::from_secs(2),
                max: Duration::from_secs(16),
                multiplier: 2.0,
            },
            timeout,
        )
        .with_clock(clock)
    }

    #[test]
    fn accepts_after_polling() -> Result<(), PipelineError> {
        let service = ScriptedService::new("sub-1");
        service.push_in_progress();
        service.push_in_progress();
        service.push_terminal(ServiceStatus::Accepted, None);

        let clock = FakeClock::default();
        let submission = client(&service, &clock, Duration::from_secs(3600))
            .run(&fake_archive())?;

        assert_eq!(submission.id, "sub-1");
        assert_eq!(submission.status, SubmissionStatus::Accepted);
        assert_eq!(clock.recorded_sleeps(), vec![
            Duration::from_secs(2),
            Duration::from_secs(4),
        ]);

        Ok(())
    }

    #[test]
    fn backoff_is_monotone_and_capped() -> Result<(), PipelineError> {
        let service = ScriptedService::new("sub-2");
        for _ in 0..8 {
            service.push_in_progress();
        }
        service.push_terminal(ServiceStatus::Accepted, None);

        let clock = FakeClock::default();
        client(&service, &clock, Duration::from_secs(3600)).run(&fake_archive())?;

        let sleeps = clock.recorded_sleeps();
        assert!(!sleeps.is_empty());
        for pair in sleeps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(sleeps.iter().all(|d| *d <= Duration::from_secs(16)));
        assert_eq!(*sleeps.last().unwrap(), Duration::from_secs(16));

        Ok(())
    }

    #[test]
    fn rejection_surfaces_log_verbatim() -> Result<(), PipelineError> {
        let service = ScriptedService::new("sub-3");
        service.push_terminal(ServiceStatus::Rejected, Some("hardened runtime not enabled"));

        let clock = FakeClock::default();
        let submission =
            client(&service, &clock, Duration::from_secs(3600)).run(&fake_archive())?;

        assert_eq!(submission.status, SubmissionStatus::Rejected);
        assert_eq!(
            submission.log.as_deref(),
            Some("hardened runtime not enabled")
        );

        Ok(())
    }

    #[test]
    fn transient_failures_retry_fatal_failures_abort() {
        let service = ScriptedService::new("sub-4");
        service.push_error(PipelineError::SubmissionTransient("503".to_string()));
        service.push_terminal(ServiceStatus::Accepted, None);

        let clock = FakeClock::default();
        let submission = client(&service, &clock, Duration::from_secs(3600))
            .run(&fake_archive())
            .unwrap();
        assert_eq!(submission.status, SubmissionStatus::Accepted);

        let service = ScriptedService::new("sub-5");
        service.push_error(PipelineError::SubmissionFatal("bad credentials".to_string()));

        let clock = FakeClock::default();
        let result = client(&service, &clock, Duration::from_secs(3600)).run(&fake_archive());
        assert!(matches!(result, Err(PipelineError::SubmissionFatal(_))));
    }

    #[test]
    fn transient_submit_failures_retry() -> Result<(), PipelineError> {
        let service = ScriptedService::new("sub-6");
        service
            .submit_failures
            .lock()
            .unwrap()
            .push_back(PipelineError::SubmissionTransient("connect reset".to_string()));
        service.push_terminal(ServiceStatus::Accepted, None);

        let clock = FakeClock::default();
        let submission =
            client(&service, &clock, Duration::from_secs(3600)).run(&fake_archive())?;

        assert_eq!(submission.status, SubmissionStatus::Accepted);
        assert_eq!(*service.submit_count.lock().unwrap(), 2);

        Ok(())
    }

    #[test]
    fn overall_timeout_yields_timed_out_submission() -> Result<(), PipelineError> {
        let service = ScriptedService::new("sub-7");
        // Script never reaches a terminal state.
        for _ in 0..64 {
            service.push_in_progress();
        }

        let clock = FakeClock::default();
        let submission =
            client(&service, &clock, Duration::from_secs(10)).run(&fake_archive())?;

        assert_eq!(submission.status, SubmissionStatus::TimedOut);

        Ok(())
    }

    #[test]
    fn cancellation_is_a_first_class_exit() {
        let service = ScriptedService::new("sub-8");
        service.push_in_progress();

        let clock = FakeClock::default();
        let token = CancellationToken::new();
        token.cancel();

        let result = client(&service, &clock, Duration::from_secs(3600))
            .with_cancellation(token)
            .run(&fake_archive());

        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
