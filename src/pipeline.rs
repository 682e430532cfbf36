// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! End-to-end orchestration: scan, sign, archive, notarize, staple.

The pipeline sequences the stages, owns the overall outcome, and keeps
credential lifetime scoped to the stages that need it. Every run ends in
a structured report with a deterministic exit code; stage failures are
part of the report, not panics.
*/

use {
    crate::{
        archiving::{Archiver, SubmissionArchive},
        credentials::CredentialProvider,
        error::PipelineError,
        notary::{
            CancellationToken, Clock, NotarizationClient, NotarizationSubmission, NotaryService,
            PollConfig, SubmissionStatus, SYSTEM_CLOCK,
        },
        scanning::{Artifact, BinaryScanner},
        signing::{SignReport, Signer, SigningBackend, SigningIdentity},
        stapling::{StapleOutcome, Stapler},
    },
    log::{error, info},
    serde::Serialize,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Tunables for a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory containing the artifacts to process.
    pub input: PathBuf,

    /// Maximum number of artifacts signed concurrently.
    pub concurrency: usize,

    /// Overall budget for submission and polling.
    pub timeout: Duration,

    pub poll: PollConfig,

    /// Whether to staple tickets after acceptance.
    pub staple: bool,

    /// Where to write the submission archive. Defaults to a sibling of
    /// the input named `<input>.zip`.
    pub archive_path: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(input: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            concurrency: 1,
            timeout: Duration::from_secs(3600),
            poll: PollConfig::default(),
            staple: true,
            archive_path: None,
        }
    }

    fn effective_archive_path(&self) -> PathBuf {
        if let Some(path) = &self.archive_path {
            path.clone()
        } else {
            let name = self
                .input
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "submission".to_string());

            self.input.with_file_name(format!("{}.zip", name))
        }
    }
}

/// The stage a failed run stopped in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Scan,
    Sign,
    Archive,
    Notarize,
    Rejected,
    TimedOut,
    Cancelled,
}

/// Terminal outcome of a run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case", tag = "result")]
pub enum RunOutcome {
    Success {
        /// True when notarization succeeded but stapling did not. The
        /// artifacts are notarized and validate online.
        degraded: bool,
    },
    Failed {
        stage: FailureStage,
        reason: String,
    },
}

/// Structured record of everything a run did.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineRun {
    pub artifacts: Vec<Artifact>,
    pub sign: Option<SignReport>,
    pub archive: Option<SubmissionArchive>,
    pub submission: Option<NotarizationSubmission>,
    pub staple: Option<StapleOutcome>,
    pub outcome: RunOutcome,
}

impl PipelineRun {
    fn failed(stage: FailureStage, reason: impl ToString) -> Self {
        Self {
            artifacts: Vec::new(),
            sign: None,
            archive: None,
            submission: None,
            staple: None,
            outcome: RunOutcome::Failed {
                stage,
                reason: reason.to_string(),
            },
        }
    }

    /// Process exit code for this outcome.
    ///
    /// 0 success (degraded or not), 1 signing or internal failure, 2
    /// rejected by the service, 3 timed out waiting, 4 packaging failure.
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            RunOutcome::Success { .. } => 0,
            RunOutcome::Failed { stage, .. } => match stage {
                FailureStage::Scan | FailureStage::Sign => 1,
                FailureStage::Rejected => 2,
                FailureStage::TimedOut => 3,
                FailureStage::Archive => 4,
                FailureStage::Notarize | FailureStage::Cancelled => 1,
            },
        }
    }
}

/// Drives a signing and notarization run from start to finish.
pub struct Pipeline<'a> {
    backend: &'a dyn SigningBackend,
    service: &'a dyn NotaryService,
    credentials: &'a dyn CredentialProvider,
    identity: SigningIdentity,
    config: PipelineConfig,
    clock: &'a dyn Clock,
    cancel: CancellationToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        backend: &'a dyn SigningBackend,
        service: &'a dyn NotaryService,
        credentials: &'a dyn CredentialProvider,
        identity: SigningIdentity,
        config: PipelineConfig,
    ) -> Self {
        Self {
            backend,
            service,
            credentials,
            identity,
            config,
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

    /// Execute the full pipeline.
    ///
    /// Re-running over an already processed tree is safe: validly signed
    /// artifacts are skipped and a fresh submission is created for the
    /// rebuilt archive.
    pub fn run(&self) -> PipelineRun {
        let mut graph = match BinaryScanner::new(&self.config.input).scan() {
            Ok(graph) => graph,
            Err(error) => {
                error!("scan failed: {}", error);
                return PipelineRun::failed(FailureStage::Scan, error);
            }
        };

        info!("discovered {} signable artifact(s)", graph.len());

        let sign_report = {
            // Credentials live exactly as long as the signing stage.
            let scope = match self.credentials.acquire() {
                Ok(scope) => scope,
                Err(error) => {
                    error!("unable to acquire signing credentials: {}", error);
                    let mut run = PipelineRun::failed(FailureStage::Sign, error);
                    run.artifacts = graph.artifacts().to_vec();
                    return run;
                }
            };

            let identity = self.identity.with_reference(scope.reference());
            let signer = Signer::new(self.backend, &identity, self.config.concurrency);

            match signer.sign_all(&mut graph) {
                Ok(report) => report,
                Err(error) => {
                    error!("signing failed: {}", error);
                    let mut run = PipelineRun::failed(FailureStage::Sign, error);
                    run.artifacts = graph.artifacts().to_vec();
                    return run;
                }
            }
        };

        info!(
            "signing complete: {} newly signed, {} already signed",
            sign_report.newly_signed, sign_report.skipped
        );

        let archive_path = self.config.effective_archive_path();
        let archive = match Archiver::new(&self.config.input).create(&graph, &archive_path) {
            Ok(archive) => archive,
            Err(error) => {
                error!("archiving failed: {}", error);
                let mut run = PipelineRun::failed(FailureStage::Archive, error);
                run.artifacts = graph.artifacts().to_vec();
                run.sign = Some(sign_report);
                return run;
            }
        };

        let client = NotarizationClient::new(self.service, self.config.poll, self.config.timeout)
            .with_clock(self.clock)
            .with_cancellation(self.cancel.clone());

        let submission = match client.run(&archive) {
            Ok(submission) => submission,
            Err(error) => {
                let stage = match error {
                    PipelineError::Cancelled => FailureStage::Cancelled,
                    _ => FailureStage::Notarize,
                };
                error!("notarization failed: {}", error);
                let mut run = PipelineRun::failed(stage, error);
                run.artifacts = graph.artifacts().to_vec();
                run.sign = Some(sign_report);
                run.archive = Some(archive);
                return run;
            }
        };

        let mut run = PipelineRun {
            artifacts: graph.artifacts().to_vec(),
            sign: Some(sign_report),
            archive: Some(archive),
            submission: None,
            staple: None,
            outcome: RunOutcome::Success { degraded: false },
        };

        match submission.status {
            SubmissionStatus::Accepted => {
                let staple = if self.config.staple {
                    Stapler::new(self.service).staple(&submission, &graph)
                } else {
                    StapleOutcome::NotAttempted
                };

                let degraded = matches!(staple, StapleOutcome::Degraded { .. });

                run.submission = Some(submission);
                run.staple = Some(staple);
                run.outcome = RunOutcome::Success { degraded };
            }
            SubmissionStatus::Rejected => {
                let reason = submission
                    .log
                    .clone()
                    .unwrap_or_else(|| "submission rejected".to_string());

                run.submission = Some(submission);
                run.outcome = RunOutcome::Failed {
                    stage: FailureStage::Rejected,
                    reason,
                };
            }
            SubmissionStatus::TimedOut => {
                let reason = format!(
                    "no verdict within {}s; the submission may still complete",
                    self.config.timeout.as_secs()
                );

                run.submission = Some(submission);
                run.outcome = RunOutcome::Failed {
                    stage: FailureStage::TimedOut,
                    reason,
                };
            }
            // The client only returns terminal statuses.
            SubmissionStatus::Submitted | SubmissionStatus::Polling => {
                run.submission = Some(submission);
                run.outcome = RunOutcome::Failed {
                    stage: FailureStage::Notarize,
                    reason: "service never reached a terminal status".to_string(),
                };
            }
        }

        run
    }
}
