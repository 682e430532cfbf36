// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Attaching notarization tickets to artifacts.

Stapling a ticket lets Gatekeeper validate an artifact offline. It is a
best-effort convenience: the submission is already accepted by the time
stapling runs, so a stapling failure degrades the run instead of failing
it.
*/

use {
    crate::{
        error::PipelineError,
        notary::{NotarizationSubmission, NotaryService, SubmissionStatus},
        scanning::{ArtifactGraph, ArtifactKind},
    },
    log::{info, warn},
    serde::Serialize,
    std::path::{Path, PathBuf},
};

/// How stapling concluded.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum StapleOutcome {
    /// Tickets were written to every stapleable artifact.
    Stapled { paths: Vec<PathBuf> },

    /// Stapling could not complete. The run is still a success; the
    /// artifacts are notarized and validate online.
    Degraded { reason: String },

    /// The submission was not accepted, so there is no ticket to staple.
    NotAttempted,
}

/// Write a notarization ticket next to a bundle's signature.
///
/// Stapling a bundle is defined as writing a `Contents/CodeResources` file
/// containing the raw ticket data. Shallow bundles lack a `Contents/`
/// directory and take the file at their root.
fn staple_ticket_to_bundle(bundle_path: &Path, ticket_data: &[u8]) -> Result<PathBuf, PipelineError> {
    let path = if bundle_path.join("Contents").is_dir() {
        bundle_path.join("Contents").join("CodeResources")
    } else {
        bundle_path.join("CodeResources")
    };

    warn!("writing notarization ticket to {}", path.display());
    std::fs::write(&path, ticket_data)
        .map_err(|e| PipelineError::Staple(format!("writing {}: {}", path.display(), e)))?;

    Ok(path)
}

/// Staples notarization tickets onto accepted artifacts.
pub struct Stapler<'a> {
    service: &'a dyn NotaryService,
}

impl<'a> Stapler<'a> {
    pub fn new(service: &'a dyn NotaryService) -> Self {
        Self { service }
    }

    /// Staple every stapleable artifact in `graph`.
    ///
    /// Only bundles can carry a stapled ticket. Standalone Mach-O binaries
    /// have no place to attach one and validate online via their code
    /// directory digest; they are reported, not failed.
    pub fn staple(&self, submission: &NotarizationSubmission, graph: &ArtifactGraph) -> StapleOutcome {
        if submission.status != SubmissionStatus::Accepted {
            return StapleOutcome::NotAttempted;
        }

        let ticket = match self.service.fetch_ticket(&submission.id) {
            Ok(ticket) => ticket,
            Err(error) => {
                warn!("unable to retrieve notarization ticket: {}", error);
                return StapleOutcome::Degraded {
                    reason: format!("ticket retrieval failed: {}", error),
                };
            }
        };

        info!("retrieved notarization ticket ({} bytes)", ticket.len());

        let mut paths = Vec::new();

        for artifact in graph.artifacts() {
            match artifact.kind {
                ArtifactKind::Bundle => {
                    match staple_ticket_to_bundle(&artifact.path, &ticket) {
                        Ok(path) => paths.push(path),
                        Err(error) => {
                            warn!("stapling {} failed: {}", artifact.path.display(), error);
                            return StapleOutcome::Degraded {
                                reason: error.to_string(),
                            };
                        }
                    }
                }
                ArtifactKind::Executable | ArtifactKind::DynamicLibrary => {
                    info!(
                        "{} is a standalone Mach-O and cannot carry a stapled ticket; \
                         it will validate online",
                        artifact.path.display()
                    );
                }
            }
        }

        StapleOutcome::Stapled { paths }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            notary::testutil::ScriptedService,
            scanning::{fixtures, BinaryScanner},
        },
    };

    fn accepted(id: &str) -> NotarizationSubmission {
        NotarizationSubmission {
            id: id.to_string(),
            status: SubmissionStatus::Accepted,
            log: None,
        }
    }

    #[test]
    fn staples_bundles_and_skips_loose_binaries() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        fixtures::write_bundle(dir.path(), "App.app", "App");
        fixtures::write_executable(&dir.path().join("tool"));

        let graph = BinaryScanner::new(dir.path()).scan()?;

        let service = ScriptedService::new("sub-1");
        let outcome = Stapler::new(&service).staple(&accepted("sub-1"), &graph);

        match outcome {
            StapleOutcome::Stapled { paths } => {
                assert_eq!(paths.len(), 1);
                assert!(paths[0].ends_with("Contents/CodeResources"));
                assert_eq!(std::fs::read(&paths[0])?, b"ticket");
            }
            other => panic!("expected stapled outcome, got {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn ticket_fetch_failure_degrades_instead_of_failing() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        fixtures::write_bundle(dir.path(), "App.app", "App");

        let graph = BinaryScanner::new(dir.path()).scan()?;

        let service = ScriptedService::new("sub-2");
        service.fail_ticket_fetch("lookup service unavailable");

        let outcome = Stapler::new(&service).staple(&accepted("sub-2"), &graph);

        assert!(matches!(outcome, StapleOutcome::Degraded { .. }));

        Ok(())
    }

    #[test]
    fn unaccepted_submissions_are_not_stapled() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        fixtures::write_bundle(dir.path(), "App.app", "App");

        let graph = BinaryScanner::new(dir.path()).scan()?;
        let service = ScriptedService::new("sub-3");

        let submission = NotarizationSubmission {
            id: "sub-3".to_string(),
            status: SubmissionStatus::Rejected,
            log: Some("issues found".to_string()),
        };

        let outcome = Stapler::new(&service).staple(&submission, &graph);
        assert!(matches!(outcome, StapleOutcome::NotAttempted));

        Ok(())
    }
}
