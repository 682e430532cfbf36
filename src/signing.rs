// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Applying a signing identity across the artifact graph.

The cryptographic signing primitive is delegated to the operating
system's signing facility. This module owns identity options, the
verify-after-sign discipline, idempotent re-signing, and the
nesting-aware scheduling that keeps a bundle from being signed before
its contents.
*/

use {
    crate::{
        error::PipelineError,
        scanning::{ArtifactGraph, ArtifactKind},
    },
    log::{info, warn},
    serde::Serialize,
    std::{
        collections::BTreeSet,
        ffi::OsString,
        path::{Path, PathBuf},
        sync::mpsc,
    },
};

/// A reference to externally provisioned signing credentials plus the
/// options applied with them. Immutable for the duration of a run.
#[derive(Clone, Debug)]
pub struct SigningIdentity {
    /// Handle understood by the signing facility (certificate name or
    /// SHA-1 fingerprint).
    pub reference: String,
    pub hardened_runtime: bool,
    pub timestamp: bool,
    pub entitlements: Option<PathBuf>,
}

impl SigningIdentity {
    pub fn new(reference: impl ToString) -> Self {
        Self {
            reference: reference.to_string(),
            hardened_runtime: true,
            timestamp: true,
            entitlements: None,
        }
    }

    pub fn entitlements(mut self, path: impl AsRef<Path>) -> Self {
        self.entitlements = Some(path.as_ref().to_path_buf());
        self
    }

    /// The same options bound to a different credential reference, e.g.
    /// one resolved inside an ephemeral keychain.
    pub fn with_reference(&self, reference: impl ToString) -> Self {
        let mut identity = self.clone();
        identity.reference = reference.to_string();
        identity
    }
}

/// Seam to the OS signing facility.
///
/// Implementations must be safe to call from multiple threads, as the
/// signer dispatches independent artifacts concurrently.
pub trait SigningBackend: Sync {
    /// Apply the identity to the entity at `path`.
    fn sign(&self, path: &Path, identity: &SigningIdentity) -> Result<(), PipelineError>;

    /// Verify the signature of the entity at `path`.
    fn verify(&self, path: &Path) -> Result<(), PipelineError>;

    /// Whether `path` already carries a valid signature from `identity`.
    ///
    /// Used for idempotent re-runs: resumption trusts actual signature
    /// validity, never timestamps or markers left by a previous run.
    fn already_signed(&self, path: &Path, identity: &SigningIdentity)
        -> Result<bool, PipelineError>;
}

/// [SigningBackend] that drives the `codesign` tool.
pub struct CodesignBackend {
    exe: PathBuf,
    keychain: Option<PathBuf>,
}

impl CodesignBackend {
    pub fn new() -> Result<Self, PipelineError> {
        let exe = which::which("codesign")
            .map_err(|_| PipelineError::ToolNotFound("codesign".to_string()))?;

        Ok(Self {
            exe,
            keychain: None,
        })
    }

    /// Restrict identity lookups to a specific keychain, typically the
    /// run's ephemeral one.
    pub fn with_keychain(mut self, keychain: impl AsRef<Path>) -> Self {
        self.keychain = Some(keychain.as_ref().to_path_buf());
        self
    }

    fn run(&self, args: Vec<OsString>) -> Result<std::process::Output, PipelineError> {
        Ok(duct::cmd(&self.exe, args)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()?)
    }
}

impl SigningBackend for CodesignBackend {
    fn sign(&self, path: &Path, identity: &SigningIdentity) -> Result<(), PipelineError> {
        let mut args: Vec<OsString> = vec![
            "--sign".into(),
            identity.reference.clone().into(),
            "--force".into(),
        ];

        if identity.hardened_runtime {
            args.push("--options".into());
            args.push("runtime".into());
        }

        if identity.timestamp {
            args.push("--timestamp".into());
        }

        if let Some(entitlements) = &identity.entitlements {
            args.push("--entitlements".into());
            args.push(entitlements.clone().into());
        }

        if let Some(keychain) = &self.keychain {
            args.push("--keychain".into());
            args.push(keychain.clone().into());
        }

        args.push(path.as_os_str().to_os_string());

        let output = self.run(args)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PipelineError::Sign {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            })
        }
    }

    fn verify(&self, path: &Path) -> Result<(), PipelineError> {
        let output = self.run(vec![
            "--verify".into(),
            "--strict".into(),
            path.as_os_str().to_os_string(),
        ])?;

        if output.status.success() {
            Ok(())
        } else {
            Err(PipelineError::Verify(path.to_path_buf()))
        }
    }

    fn already_signed(
        &self,
        path: &Path,
        identity: &SigningIdentity,
    ) -> Result<bool, PipelineError> {
        let verify = self.run(vec![
            "--verify".into(),
            "--strict".into(),
            path.as_os_str().to_os_string(),
        ])?;

        if !verify.status.success() {
            return Ok(false);
        }

        // The signature is valid; check it chains to our identity. The
        // display output lists Authority lines for named identities and
        // the CDHash for fingerprint references.
        let display = self.run(vec![
            "--display".into(),
            "--verbose=4".into(),
            path.as_os_str().to_os_string(),
        ])?;

        let text = String::from_utf8_lossy(&display.stdout).to_string();

        Ok(display.status.success() && text.contains(&identity.reference))
    }
}

/// Totals for a signing pass.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SignReport {
    /// Artifacts that received a new signature this run.
    pub newly_signed: usize,
    /// Artifacts skipped because they were already validly signed with
    /// the same identity.
    pub skipped: usize,
}

/// Signs every artifact in a graph, nested artifacts strictly before
/// their enclosing bundles.
pub struct Signer<'a> {
    backend: &'a dyn SigningBackend,
    identity: &'a SigningIdentity,
    concurrency: usize,
}

impl<'a> Signer<'a> {
    pub fn new(
        backend: &'a dyn SigningBackend,
        identity: &'a SigningIdentity,
        concurrency: usize,
    ) -> Self {
        Self {
            backend,
            identity,
            concurrency: concurrency.max(1),
        }
    }

    /// Sign and verify every artifact, scheduling independent artifacts
    /// concurrently up to the configured limit.
    ///
    /// Dispatch follows the graph's deterministic order: among ready
    /// artifacts the lowest-index one starts first, so a serial run signs
    /// in exactly the scanner's inside-out order. On the first failure no
    /// further work is issued; in-flight operations drain before the
    /// error is returned and no artifact past the failure is marked
    /// sealed.
    pub fn sign_all(&self, graph: &mut ArtifactGraph) -> Result<SignReport, PipelineError> {
        let count = graph.len();
        let mut remaining = graph.dependency_counts();
        let dependents = graph.dependents();

        let mut ready: BTreeSet<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
        let mut outcomes: Vec<Option<bool>> = vec![None; count];
        let mut failure: Option<PipelineError> = None;

        let (tx, rx) = mpsc::channel::<(usize, Result<bool, PipelineError>)>();

        std::thread::scope(|scope| {
            let mut in_flight = 0usize;

            loop {
                if failure.is_none() {
                    while in_flight < self.concurrency {
                        let index = match ready.iter().next() {
                            Some(&index) => index,
                            None => break,
                        };
                        ready.remove(&index);

                        let artifact = &graph.artifacts()[index];
                        let path = artifact.path.clone();
                        let kind = artifact.kind;
                        let backend = self.backend;
                        let identity = self.identity;
                        let tx = tx.clone();

                        in_flight += 1;

                        scope.spawn(move || {
                            let result = sign_one(backend, identity, &path, kind);
                            // The receiver outlives the scope; send only
                            // fails if the scheduler already bailed.
                            tx.send((index, result)).ok();
                        });
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let (index, result) = rx
                    .recv()
                    .expect("signing worker channel closed unexpectedly");
                in_flight -= 1;

                match result {
                    Ok(was_skipped) => {
                        outcomes[index] = Some(was_skipped);

                        for &dependent in &dependents[index] {
                            remaining[dependent] -= 1;
                            if remaining[dependent] == 0 {
                                ready.insert(dependent);
                            }
                        }
                    }
                    Err(error) => {
                        warn!("halting signing after failure: {}", error);
                        if failure.is_none() {
                            failure = Some(error);
                        }
                    }
                }
            }
        });

        if let Some(error) = failure {
            return Err(error);
        }

        let mut report = SignReport::default();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            // Every artifact completed; an unfinished graph without a
            // failure would mean a dependency cycle, which filesystem
            // containment cannot produce.
            if outcome == Some(true) {
                report.skipped += 1;
            } else {
                report.newly_signed += 1;
            }
            graph.mark_sealed(index);
        }

        Ok(report)
    }
}

fn sign_one(
    backend: &dyn SigningBackend,
    identity: &SigningIdentity,
    path: &Path,
    kind: ArtifactKind,
) -> Result<bool, PipelineError> {
    if backend.already_signed(path, identity)? {
        info!("already validly signed; skipping {}", path.display());
        return Ok(true);
    }

    info!("signing {:?} at {}", kind, path.display());
    backend.sign(path, identity)?;
    backend.verify(path)?;

    Ok(false)
}


#[cfg(test)]
mod test {
    use {
        super::{testutil::RecordingBackend, *},
        crate::scanning::{fixtures, BinaryScanner},
    };

    fn scan_fixture_tree(dir: &Path) -> ArtifactGraph {
        BinaryScanner::new(dir).scan().unwrap()
    }

    #[test]
    fn serial_signing_follows_inside_out_order() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let bundle = fixtures::write_bundle(dir.path(), "App.app", "App");
        let frameworks = bundle.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&frameworks)?;
        fixtures::write_dylib(&frameworks.join("libnested.dylib"));
        fixtures::write_executable(&dir.path().join("bin-a"));
        fixtures::write_executable(&dir.path().join("bin-b"));

        let mut graph = scan_fixture_tree(dir.path());
        let backend = RecordingBackend::default();
        let identity = SigningIdentity::new("Developer ID Application: Example");

        let report = Signer::new(&backend, &identity, 1).sign_all(&mut graph)?;

        assert_eq!(report.newly_signed, 4);
        assert_eq!(report.skipped, 0);
        assert_eq!(
            backend.sign_log(),
            vec![
                frameworks.join("libnested.dylib"),
                bundle,
                dir.path().join("bin-a"),
                dir.path().join("bin-b"),
            ]
        );
        assert!(graph.all_sealed());

        Ok(())
    }

    #[test]
    fn three_level_nesting_signs_leaf_then_parent_then_grandparent(
    ) -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let outer = fixtures::write_bundle(dir.path(), "Outer.app", "Outer");
        let plugins = outer.join("Contents").join("PlugIns");
        std::fs::create_dir_all(&plugins)?;
        let inner = fixtures::write_bundle(&plugins, "Inner.app", "Inner");
        let inner_frameworks = inner.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&inner_frameworks)?;
        let leaf = inner_frameworks.join("libleaf.dylib");
        fixtures::write_dylib(&leaf);

        let mut graph = scan_fixture_tree(dir.path());
        let backend = RecordingBackend::default();
        let identity = SigningIdentity::new("Developer ID Application: Example");

        Signer::new(&backend, &identity, 4).sign_all(&mut graph)?;

        let log = backend.sign_log();
        let position = |path: &Path| log.iter().position(|p| p == path).unwrap();

        assert!(position(&leaf) < position(&inner));
        assert!(position(&inner) < position(&outer));

        Ok(())
    }

    #[test]
    fn bundle_never_signs_before_nested_contents() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let bundle = fixtures::write_bundle(dir.path(), "App.app", "App");
        let frameworks = bundle.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&frameworks)?;
        for name in ["liba.dylib", "libb.dylib", "libc.dylib"] {
            fixtures::write_dylib(&frameworks.join(name));
        }

        let mut graph = scan_fixture_tree(dir.path());
        let backend = RecordingBackend::default();
        let identity = SigningIdentity::new("Developer ID Application: Example");

        Signer::new(&backend, &identity, 4).sign_all(&mut graph)?;

        let log = backend.sign_log();
        let bundle_position = log.iter().position(|p| p == &bundle).unwrap();
        assert_eq!(bundle_position, log.len() - 1);

        Ok(())
    }

    #[test]
    fn verification_failure_halts_and_unrelated_work_drains() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let bundle = fixtures::write_bundle(dir.path(), "App.app", "App");
        let frameworks = bundle.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&frameworks)?;
        let poisoned = frameworks.join("libnested.dylib");
        fixtures::write_dylib(&poisoned);

        let mut graph = scan_fixture_tree(dir.path());
        let backend = RecordingBackend::default();
        backend.fail_verification_of(&poisoned);
        let identity = SigningIdentity::new("Developer ID Application: Example");

        let result = Signer::new(&backend, &identity, 1).sign_all(&mut graph);

        match result {
            Err(PipelineError::Verify(path)) => assert_eq!(path, poisoned),
            other => panic!("expected verify error, got {:?}", other.map(|_| ())),
        }

        // The bundle depended on the failed dylib and must never have
        // been dispatched.
        assert!(!backend.sign_log().contains(&bundle));
        assert!(!graph.all_sealed());

        Ok(())
    }

    #[test]
    fn resigning_a_processed_tree_is_a_no_op() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        fixtures::write_executable(&dir.path().join("tool-a"));
        fixtures::write_executable(&dir.path().join("tool-b"));

        let backend = RecordingBackend::default();
        let identity = SigningIdentity::new("Developer ID Application: Example");

        let mut graph = scan_fixture_tree(dir.path());
        let first = Signer::new(&backend, &identity, 2).sign_all(&mut graph)?;
        assert_eq!(first.newly_signed, 2);

        // Simulate a rerun against the already-signed tree.
        for path in backend.sign_log() {
            backend.mark_pre_signed(&path);
        }

        let mut graph = scan_fixture_tree(dir.path());
        let count_before = backend.sign_log().len();
        let second = Signer::new(&backend, &identity, 2).sign_all(&mut graph)?;

        assert_eq!(second.newly_signed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(backend.sign_log().len(), count_before);
        assert!(graph.all_sealed());

        Ok(())
    }
}
