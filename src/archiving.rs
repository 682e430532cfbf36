// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Packaging a signed tree into a single submission unit.

The remote service inspects a packaged unit, not loose files, so the
archive must preserve directory structure, permissions, and symbolic
links. Compression is lossless Deflate; compiled binaries are never
recompressed lossily.
*/

use {
    crate::{
        error::PipelineError,
        scanning::{ArtifactGraph, ArtifactKind},
    },
    log::{info, warn},
    serde::Serialize,
    sha2::{Digest, Sha256},
    std::{
        fs::File,
        io::{Read, Write},
        path::{Path, PathBuf},
    },
    walkdir::WalkDir,
    zip::{write::FileOptions, CompressionMethod, ZipWriter},
};

/// A packaged submission unit derived from a fully signed tree.
#[derive(Clone, Debug, Serialize)]
pub struct SubmissionArchive {
    pub path: PathBuf,
    /// Hex SHA-256 of the archive, recorded for auditing and required by
    /// the submission request.
    pub sha256: String,
    /// The artifacts the archive was built from.
    pub artifacts: Vec<PathBuf>,
    /// The outermost bundle, or the first artifact when the tree holds
    /// only loose binaries. Its code directory digest keys the
    /// notarization ticket record.
    pub primary_artifact: Option<PathBuf>,
}

/// Compute the hex SHA-256 digest of a file by streaming its content.
pub fn digest_sha256(path: &Path) -> Result<String, PipelineError> {
    let mut fh = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 16384];

    loop {
        let count = fh.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[0..count]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn entry_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn entry_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Packages a signed artifact tree into a zip archive.
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Build the archive at `dest`.
    ///
    /// Hard precondition: every artifact in the graph is signed and
    /// verified. A violation is an archive error, never a silent skip.
    pub fn create(
        &self,
        graph: &ArtifactGraph,
        dest: &Path,
    ) -> Result<SubmissionArchive, PipelineError> {
        for artifact in graph.artifacts() {
            if !artifact.is_sealed() {
                return Err(PipelineError::Archive(format!(
                    "artifact {} is not signed and verified",
                    artifact.path.display()
                )));
            }
        }

        let root_name = self
            .root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                PipelineError::Archive(format!(
                    "cannot derive archive member prefix from {}",
                    self.root.display()
                ))
            })?;

        info!(
            "archiving {} into {}",
            self.root.display(),
            dest.display()
        );

        let mut zf = ZipWriter::new(File::create(dest)?);

        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
        {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walked entries always live under the walk root");
            let name = format!("{}/{}", root_name, relative.display());

            let metadata = std::fs::symlink_metadata(entry.path())?;

            if metadata.file_type().is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                let options = FileOptions::default()
                    .compression_method(CompressionMethod::Stored)
                    .unix_permissions(0o755);
                zf.add_symlink(name, target.to_string_lossy().to_string(), options)?;
            } else if metadata.is_dir() {
                let options =
                    FileOptions::default().unix_permissions(entry_mode(&metadata) & 0o7777);
                zf.add_directory(name, options)?;
            } else {
                let options = FileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(entry_mode(&metadata) & 0o7777);
                zf.start_file(name, options)?;
                let mut fh = File::open(entry.path())?;
                std::io::copy(&mut fh, &mut zf)?;
            }
        }

        let mut inner = zf.finish()?;
        inner.flush()?;
        drop(inner);

        let sha256 = digest_sha256(dest)?;
        warn!("archive {} sha256={}", dest.display(), sha256);

        let primary_artifact = graph
            .artifacts()
            .iter()
            .filter(|artifact| artifact.kind == ArtifactKind::Bundle)
            .min_by_key(|artifact| artifact.depth)
            .or_else(|| graph.artifacts().first())
            .map(|artifact| artifact.path.clone());

        Ok(SubmissionArchive {
            path: dest.to_path_buf(),
            sha256,
            artifacts: graph
                .artifacts()
                .iter()
                .map(|artifact| artifact.path.clone())
                .collect(),
            primary_artifact,
        })
    }
}
