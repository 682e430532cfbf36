// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Acquiring and releasing signing credentials.

A credential provider turns configured secrets into something the
signing tool can use and guarantees cleanup: the returned scope releases
its resources when dropped, on success and failure alike.
*/

use {
    crate::error::PipelineError,
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Acquires signing credentials for the duration of a run.
pub trait CredentialProvider {
    fn acquire(&self) -> Result<CredentialScope, PipelineError>;
}

/// Live signing credentials, released on drop.
pub struct CredentialScope {
    reference: String,
    keychain: Option<PathBuf>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CredentialScope {
    /// The identity reference to pass to the signing tool.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Keychain holding the identity, if one was materialized.
    pub fn keychain(&self) -> Option<&Path> {
        self.keychain.as_deref()
    }
}

impl Drop for CredentialScope {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Provider for an identity already present in the signing environment,
/// such as one installed in the login keychain.
pub struct StaticCredentialProvider {
    reference: String,
}

impl StaticCredentialProvider {
    pub fn new(reference: impl ToString) -> Self {
        Self {
            reference: reference.to_string(),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn acquire(&self) -> Result<CredentialScope, PipelineError> {
        Ok(CredentialScope {
            reference: self.reference.clone(),
            keychain: None,
            release: None,
        })
    }
}

fn security_exe() -> Result<PathBuf, PipelineError> {
    which::which("security").map_err(|_| PipelineError::ToolNotFound("security".to_string()))
}

fn run_security(exe: &Path, args: Vec<String>) -> Result<(), PipelineError> {
    let output = duct::cmd(exe, args).stderr_capture().unchecked().run()?;

    if output.status.success() {
        Ok(())
    } else {
        Err(PipelineError::CredentialStore(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

fn read_security(exe: &Path, args: Vec<String>) -> Result<String, PipelineError> {
    let output = duct::cmd(exe, args)
        .stderr_capture()
        .stdout_capture()
        .unchecked()
        .run()?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(PipelineError::CredentialStore(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Parse `security list-keychains` output into keychain paths.
///
/// Each line holds an indented, quoted path.
fn parse_keychain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('"').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Provider that imports a PKCS#12 certificate into a throwaway keychain.
///
/// The keychain lives under a temporary directory with a unique name and
/// is deleted when the scope drops, so the host keychain state is never
/// touched.
pub struct EphemeralKeychainProvider {
    reference: String,
    p12_path: PathBuf,
    p12_password: String,
}

impl EphemeralKeychainProvider {
    pub fn new(
        reference: impl ToString,
        p12_path: impl AsRef<Path>,
        p12_password: impl ToString,
    ) -> Self {
        Self {
            reference: reference.to_string(),
            p12_path: p12_path.as_ref().to_path_buf(),
            p12_password: p12_password.to_string(),
        }
    }
}

impl CredentialProvider for EphemeralKeychainProvider {
    fn acquire(&self) -> Result<CredentialScope, PipelineError> {
        let exe = security_exe()?;

        let dir = tempfile::tempdir()?;
        let keychain = dir
            .path()
            .join(format!("signing-{}.keychain", uuid::Uuid::new_v4()));
        let keychain_str = keychain.display().to_string();

        // An empty password keeps the keychain unlockable without
        // interactive prompts. It only ever holds this one identity and
        // is deleted at scope exit.
        run_security(
            &exe,
            vec![
                "create-keychain".to_string(),
                "-p".to_string(),
                String::new(),
                keychain_str.clone(),
            ],
        )?;

        // Remember the current search list so it can be restored verbatim.
        let original_list = parse_keychain_list(&read_security(
            &exe,
            vec!["list-keychains".to_string(), "-d".to_string(), "user".to_string()],
        )?);

        let cleanup_exe = exe.clone();
        let cleanup_keychain = keychain_str.clone();
        let cleanup_list = original_list.clone();
        let cleanup = move || {
            let mut restore = vec![
                "list-keychains".to_string(),
                "-d".to_string(),
                "user".to_string(),
                "-s".to_string(),
            ];
            restore.extend(cleanup_list);

            if let Err(error) = run_security(&cleanup_exe, restore) {
                warn!("unable to restore keychain search list: {}", error);
            }

            info!("deleting ephemeral keychain {}", cleanup_keychain);
            if let Err(error) = run_security(
                &cleanup_exe,
                vec!["delete-keychain".to_string(), cleanup_keychain.clone()],
            ) {
                warn!(
                    "unable to delete ephemeral keychain {}: {}",
                    cleanup_keychain, error
                );
            }
            // The TempDir removes the backing file even if delete-keychain
            // did not run.
            drop(dir);
        };

        let import = (|| {
            run_security(
                &exe,
                vec![
                    "unlock-keychain".to_string(),
                    "-p".to_string(),
                    String::new(),
                    keychain_str.clone(),
                ],
            )?;

            run_security(
                &exe,
                vec![
                    "import".to_string(),
                    self.p12_path.display().to_string(),
                    "-k".to_string(),
                    keychain_str.clone(),
                    "-P".to_string(),
                    self.p12_password.clone(),
                    "-T".to_string(),
                    "/usr/bin/codesign".to_string(),
                ],
            )?;

            // Splice the new keychain into the search list so the signing
            // tool can resolve the identity without extra flags.
            let mut set_list = vec![
                "list-keychains".to_string(),
                "-d".to_string(),
                "user".to_string(),
                "-s".to_string(),
                keychain_str.clone(),
            ];
            set_list.extend(original_list.iter().cloned());

            run_security(&exe, set_list)
        })();

        if let Err(error) = import {
            cleanup();
            return Err(error);
        }

        info!("imported signing identity into {}", keychain_str);

        Ok(CredentialScope {
            reference: self.reference.clone(),
            keychain: Some(keychain),
            release: Some(Box::new(cleanup)),
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    #[test]
    fn keychain_list_parsing() {
        let output = "    \"/Users/dev/Library/Keychains/login.keychain-db\"\n    \"/Library/Keychains/System.keychain\"\n";
        assert_eq!(
            parse_keychain_list(output),
            vec![
                "/Users/dev/Library/Keychains/login.keychain-db".to_string(),
                "/Library/Keychains/System.keychain".to_string(),
            ]
        );
    }

    #[test]
    fn static_provider_has_no_keychain() -> Result<(), PipelineError> {
        let scope = StaticCredentialProvider::new("Developer ID Application: Example").acquire()?;

        assert_eq!(scope.reference(), "Developer ID Application: Example");
        assert!(scope.keychain().is_none());

        Ok(())
    }

    #[test]
    fn scope_release_runs_exactly_once_on_drop() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let scope = CredentialScope {
            reference: "test".to_string(),
            keychain: None,
            release: Some(Box::new(move || {
                assert!(!flag.swap(true, Ordering::SeqCst));
            })),
        };

        assert!(!released.load(Ordering::SeqCst));
        drop(scope);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn scope_releases_when_a_run_fails() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();

        let result: Result<(), PipelineError> = (|| {
            let _scope = CredentialScope {
                reference: "test".to_string(),
                keychain: None,
                release: Some(Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                })),
            };

            Err(PipelineError::Verify(PathBuf::from("/tmp/app")))
        })();

        assert!(result.is_err());
        assert!(released.load(Ordering::SeqCst));
    }
}
