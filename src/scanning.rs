// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Discovery of signable artifacts in a directory tree.

Artifacts are classified by their binary header, never by file name or
extension. Bundles (directory-shaped artifacts with an `Info.plist`) are
discovered structurally and their nested contents are ordered before the
bundle itself, because a bundle's own signature seals its contents.
*/

use {
    crate::error::PipelineError,
    goblin::mach::{
        fat::{FAT_CIGAM, FAT_MAGIC},
        header::{MH_BUNDLE, MH_CIGAM, MH_CIGAM_64, MH_DYLIB, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64},
    },
    log::{debug, info},
    serde::Serialize,
    std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    },
};

/// The kind of signable entity an [Artifact] refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Executable,
    DynamicLibrary,
    Bundle,
}

/// A discovered signable entity.
///
/// Identity is the filesystem path. Instances are created by the scanner
/// with `signed` and `verified` unset and are mutated by the signer once
/// a signature has been applied and re-verified.
#[derive(Clone, Debug, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Number of bundles enclosing this artifact.
    pub depth: usize,
    pub signed: bool,
    pub verified: bool,
}

impl Artifact {
    fn new(path: PathBuf, kind: ArtifactKind, depth: usize) -> Self {
        Self {
            path,
            kind,
            depth,
            signed: false,
            verified: false,
        }
    }

    /// Whether this artifact may enter a submission archive.
    pub fn is_sealed(&self) -> bool {
        self.signed && self.verified
    }
}

/// The ordered set of discovered artifacts plus their nesting dependencies.
///
/// Artifacts appear in deterministic inside-out signing order: within a
/// bundle every nested artifact precedes the bundle itself and unrelated
/// artifacts are ordered lexicographically by path. `dependencies[i]`
/// holds the indices of artifacts that must be signed and verified before
/// artifact `i` may start.
#[derive(Clone, Debug)]
pub struct ArtifactGraph {
    artifacts: Vec<Artifact>,
    dependencies: Vec<Vec<usize>>,
}

impl ArtifactGraph {
    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Number of unfinished prerequisites per artifact, at rest.
    pub fn dependency_counts(&self) -> Vec<usize> {
        self.dependencies.iter().map(|deps| deps.len()).collect()
    }

    /// Reverse edges: for each artifact, the artifacts that wait on it.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.artifacts.len()];

        for (index, deps) in self.dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(index);
            }
        }

        dependents
    }

    pub fn mark_sealed(&mut self, index: usize) {
        self.artifacts[index].signed = true;
        self.artifacts[index].verified = true;
    }

    pub fn all_sealed(&self) -> bool {
        self.artifacts.iter().all(|a| a.is_sealed())
    }
}

/// Offset of the `filetype` field in a thin Mach-O header.
const MACHO_FILETYPE_OFFSET: usize = 12;

// Large enough for a 64-bit Mach-O header or a fat header plus its
// first architecture entry. Real binaries are never this small, so a
// short read classifies as not-a-binary.
fn read_header(fh: &mut File, offset: u64) -> Result<Option<[u8; 32]>, PipelineError> {
    fh.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; 32];
    let mut filled = 0;

    while filled < header.len() {
        let count = fh.read(&mut header[filled..])?;
        if count == 0 {
            return Ok(None);
        }
        filled += count;
    }

    Ok(Some(header))
}

fn thin_filetype(fh: &mut File, offset: u64) -> Result<Option<u32>, PipelineError> {
    let header = match read_header(fh, offset)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let magic = goblin::mach::peek(&header, 0)?;

    let raw = [
        header[MACHO_FILETYPE_OFFSET],
        header[MACHO_FILETYPE_OFFSET + 1],
        header[MACHO_FILETYPE_OFFSET + 2],
        header[MACHO_FILETYPE_OFFSET + 3],
    ];

    // The magic is peeked big-endian, so MH_MAGIC means the header fields
    // are big-endian on disk and MH_CIGAM means they are byte-swapped
    // (little-endian, the case for every current macOS binary).
    match magic {
        MH_MAGIC | MH_MAGIC_64 => Ok(Some(u32::from_be_bytes(raw))),
        MH_CIGAM | MH_CIGAM_64 => Ok(Some(u32::from_le_bytes(raw))),
        _ => Ok(None),
    }
}

/// Classify a file by its Mach-O header.
///
/// Fat/universal binaries are classified through their first architecture
/// slice, mirroring how signature readers treat the initial Mach-O as
/// authoritative.
pub fn classify_macho(path: &Path) -> Result<Option<ArtifactKind>, PipelineError> {
    let mut fh = File::open(path)?;

    let header = match read_header(&mut fh, 0)? {
        Some(header) => header,
        None => return Ok(None),
    };

    let magic = goblin::mach::peek(&header, 0)?;

    let filetype = match magic {
        // Fat headers are big-endian on disk, so they peek as FAT_MAGIC;
        // FAT_CIGAM indicates a byte-swapped header.
        FAT_MAGIC => {
            let nfat = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            if nfat == 0 {
                return Ok(None);
            }
            let offset = u32::from_be_bytes([header[8 + 8], header[8 + 9], header[8 + 10], header[8 + 11]]);
            thin_filetype(&mut fh, offset as u64)?
        }
        FAT_CIGAM => {
            let nfat = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if nfat == 0 {
                return Ok(None);
            }
            let offset = u32::from_le_bytes([header[8 + 8], header[8 + 9], header[8 + 10], header[8 + 11]]);
            thin_filetype(&mut fh, offset as u64)?
        }
        _ => thin_filetype(&mut fh, 0)?,
    };

    Ok(match filetype {
        Some(MH_EXECUTE) => Some(ArtifactKind::Executable),
        Some(MH_DYLIB) | Some(MH_BUNDLE) => Some(ArtifactKind::DynamicLibrary),
        _ => None,
    })
}

fn bundle_info_plist(dir: &Path) -> Option<PathBuf> {
    let deep = dir.join("Contents").join("Info.plist");
    if deep.is_file() {
        return Some(deep);
    }

    let shallow = dir.join("Info.plist");
    if shallow.is_file() {
        return Some(shallow);
    }

    None
}

/// Whether a directory is a bundle (directory-shaped artifact container).
pub fn is_bundle(dir: &Path) -> bool {
    bundle_info_plist(dir).is_some()
}

/// Resolve the bundle's own top-level binary from `CFBundleExecutable`.
fn bundle_main_binary(dir: &Path) -> Result<Option<PathBuf>, PipelineError> {
    let plist_path = match bundle_info_plist(dir) {
        Some(path) => path,
        None => return Ok(None),
    };

    let value = plist::Value::from_file(&plist_path)
        .map_err(|e| PipelineError::InfoPlist(plist_path.clone(), e))?;

    let executable = value
        .as_dictionary()
        .and_then(|dict| dict.get("CFBundleExecutable"))
        .and_then(|value| value.as_string())
        .map(|s| s.to_string());

    let executable = match executable {
        Some(executable) => executable,
        None => return Ok(None),
    };

    let deep = dir.join("Contents").join("MacOS").join(&executable);
    if deep.is_file() {
        return Ok(Some(deep));
    }

    let shallow = dir.join(&executable);
    if shallow.is_file() {
        return Ok(Some(shallow));
    }

    Ok(None)
}

/// Discovers signable artifacts beneath a root directory.
pub struct BinaryScanner {
    root: PathBuf,
}

impl BinaryScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Walk the tree and produce the artifact graph.
    ///
    /// Errors with a scan error if the root does not exist or no signable
    /// artifact is found.
    pub fn scan(&self) -> Result<ArtifactGraph, PipelineError> {
        if !self.root.is_dir() {
            return Err(PipelineError::Scan(format!(
                "input path {} does not exist or is not a directory",
                self.root.display()
            )));
        }

        let mut artifacts = Vec::new();
        let mut dependencies = Vec::new();

        if is_bundle(&self.root) {
            self.scan_bundle(&self.root, 0, &mut artifacts, &mut dependencies)?;
        } else {
            self.scan_dir(&self.root, 0, None, None, &mut artifacts, &mut dependencies)?;
        }

        if artifacts.is_empty() {
            return Err(PipelineError::Scan(format!(
                "no signable artifacts found under {}",
                self.root.display()
            )));
        }

        info!(
            "discovered {} signable artifact(s) under {}",
            artifacts.len(),
            self.root.display()
        );

        Ok(ArtifactGraph {
            artifacts,
            dependencies,
        })
    }

    /// Scan a plain directory, collecting the indices of artifacts found
    /// beneath it. `skip` is the enclosing bundle's own binary, which is
    /// represented by the bundle artifact rather than by itself.
    /// `contents` is the enclosing deep bundle's `Contents` directory; it
    /// holds the bundle's `Info.plist` and must not be re-detected as a
    /// shallow bundle of its own.
    fn scan_dir(
        &self,
        dir: &Path,
        depth: usize,
        skip: Option<&Path>,
        contents: Option<&Path>,
        artifacts: &mut Vec<Artifact>,
        dependencies: &mut Vec<Vec<usize>>,
    ) -> Result<Vec<usize>, PipelineError> {
        let mut entries = std::fs::read_dir(dir)?
            .collect::<Result<Vec<_>, std::io::Error>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut found = Vec::new();

        for entry in entries {
            let path = entry.path();
            let metadata = std::fs::symlink_metadata(&path)?;

            if metadata.file_type().is_symlink() {
                // Symlinks are preserved by the archiver but their targets
                // are signed at the target path, not through the link.
                debug!("skipping symlink {}", path.display());
                continue;
            }

            if metadata.is_dir() {
                if contents != Some(path.as_path()) && is_bundle(&path) {
                    found.extend(self.scan_bundle(&path, depth, artifacts, dependencies)?);
                } else {
                    found.extend(self.scan_dir(&path, depth, skip, None, artifacts, dependencies)?);
                }
            } else if metadata.is_file() {
                if skip == Some(path.as_path()) {
                    continue;
                }

                if let Some(kind) = classify_macho(&path)? {
                    debug!("classified {} as {:?}", path.display(), kind);
                    artifacts.push(Artifact::new(path, kind, depth));
                    dependencies.push(Vec::new());
                    found.push(artifacts.len() - 1);
                }
            }
        }

        Ok(found)
    }

    /// Scan a bundle directory: nested artifacts first, then the bundle
    /// itself, which depends on everything found beneath it.
    fn scan_bundle(
        &self,
        dir: &Path,
        depth: usize,
        artifacts: &mut Vec<Artifact>,
        dependencies: &mut Vec<Vec<usize>>,
    ) -> Result<Vec<usize>, PipelineError> {
        let main_binary = bundle_main_binary(dir)?;

        let contents = dir.join("Contents");
        let contents = if contents.join("Info.plist").is_file() {
            Some(contents)
        } else {
            None
        };

        let mut found = self.scan_dir(
            dir,
            depth + 1,
            main_binary.as_deref(),
            contents.as_deref(),
            artifacts,
            dependencies,
        )?;

        artifacts.push(Artifact::new(
            dir.to_path_buf(),
            ArtifactKind::Bundle,
            depth,
        ));
        dependencies.push(found.clone());
        found.push(artifacts.len() - 1);

        Ok(found)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use {super::*, std::fs};

    pub fn macho_header(filetype: u32) -> Vec<u8> {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[12..16].copy_from_slice(&filetype.to_le_bytes());
        data
    }

    pub fn write_executable(path: &Path) {
        fs::write(path, macho_header(MH_EXECUTE)).unwrap();
    }

    pub fn write_dylib(path: &Path) {
        fs::write(path, macho_header(MH_DYLIB)).unwrap();
    }

    pub fn write_info_plist(path: &Path, executable: &str) {
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>{executable}</string>
    <key>CFBundleIdentifier</key>
    <string>com.example.{executable}</string>
</dict>
</plist>
"#
        );
        fs::write(path, xml).unwrap();
    }

    /// Create `<parent>/<name>` as a deep bundle whose main binary is
    /// `Contents/MacOS/<executable>`. Returns the bundle root.
    pub fn write_bundle(parent: &Path, name: &str, executable: &str) -> PathBuf {
        let bundle = parent.join(name);
        let contents = bundle.join("Contents");
        fs::create_dir_all(contents.join("MacOS")).unwrap();
        write_info_plist(&contents.join("Info.plist"), executable);
        write_executable(&contents.join("MacOS").join(executable));
        bundle
    }
}

#[cfg(test)]
mod test {
    use {super::fixtures::*, super::*};

    #[test]
    fn classify_by_header_not_extension() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;

        // A dylib named like an executable and vice versa.
        let exe = dir.path().join("libfoo.dylib");
        write_executable(&exe);
        let dylib = dir.path().join("tool");
        write_dylib(&dylib);
        std::fs::write(dir.path().join("notes.txt"), b"not a binary")?;

        assert_eq!(classify_macho(&exe)?, Some(ArtifactKind::Executable));
        assert_eq!(classify_macho(&dylib)?, Some(ArtifactKind::DynamicLibrary));
        assert_eq!(classify_macho(&dir.path().join("notes.txt"))?, None);

        Ok(())
    }

    #[test]
    fn classify_big_endian_macho() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ppc-tool");

        // Big-endian header fields, as written by old PowerPC toolchains.
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&MH_MAGIC.to_be_bytes());
        data[12..16].copy_from_slice(&MH_EXECUTE.to_be_bytes());
        std::fs::write(&path, data)?;

        assert_eq!(classify_macho(&path)?, Some(ArtifactKind::Executable));

        Ok(())
    }

    #[test]
    fn classify_fat_binary_via_first_arch() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("universal");

        let inner_offset = 64u32;
        let mut data = vec![0u8; inner_offset as usize + 32];
        data[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
        data[4..8].copy_from_slice(&1u32.to_be_bytes());
        data[16..20].copy_from_slice(&inner_offset.to_be_bytes());
        data[inner_offset as usize..inner_offset as usize + 32]
            .copy_from_slice(&macho_header(MH_EXECUTE));
        std::fs::write(&path, data)?;

        assert_eq!(classify_macho(&path)?, Some(ArtifactKind::Executable));

        Ok(())
    }

    #[test]
    fn inside_out_deterministic_ordering() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;

        let bundle = write_bundle(dir.path(), "App.app", "App");
        let frameworks = bundle.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&frameworks)?;
        write_dylib(&frameworks.join("libnested.dylib"));

        write_executable(&dir.path().join("bin-a"));
        write_executable(&dir.path().join("bin-b"));

        let graph = BinaryScanner::new(dir.path()).scan()?;

        let paths = graph
            .artifacts()
            .iter()
            .map(|a| a.path.clone())
            .collect::<Vec<_>>();

        assert_eq!(
            paths,
            vec![
                frameworks.join("libnested.dylib"),
                bundle.clone(),
                dir.path().join("bin-a"),
                dir.path().join("bin-b"),
            ]
        );

        // The bundle waits on its nested dylib; loose binaries wait on nothing.
        assert_eq!(graph.dependencies(0), &[] as &[usize]);
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[] as &[usize]);
        assert_eq!(graph.dependencies(3), &[] as &[usize]);

        // The bundle's own binary is represented by the bundle artifact.
        assert_eq!(graph.artifacts()[1].kind, ArtifactKind::Bundle);
        assert_eq!(graph.artifacts()[0].depth, 1);
        assert_eq!(graph.artifacts()[1].depth, 0);

        Ok(())
    }

    #[test]
    fn three_level_nesting_orders_leaf_first() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;

        let outer = write_bundle(dir.path(), "Outer.app", "Outer");
        let plugins = outer.join("Contents").join("PlugIns");
        std::fs::create_dir_all(&plugins)?;
        let inner = write_bundle(&plugins, "Inner.app", "Inner");
        let inner_frameworks = inner.join("Contents").join("Frameworks");
        std::fs::create_dir_all(&inner_frameworks)?;
        write_dylib(&inner_frameworks.join("libleaf.dylib"));

        let graph = BinaryScanner::new(dir.path()).scan()?;
        let paths = graph
            .artifacts()
            .iter()
            .map(|a| a.path.clone())
            .collect::<Vec<_>>();

        let leaf_index = paths
            .iter()
            .position(|p| p == &inner_frameworks.join("libleaf.dylib"))
            .unwrap();
        let inner_index = paths.iter().position(|p| p == &inner).unwrap();
        let outer_index = paths.iter().position(|p| p == &outer).unwrap();

        assert!(leaf_index < inner_index);
        assert!(inner_index < outer_index);

        assert!(graph.dependencies(inner_index).contains(&leaf_index));
        assert!(graph.dependencies(outer_index).contains(&inner_index));
        assert!(graph.dependencies(outer_index).contains(&leaf_index));

        assert_eq!(graph.artifacts()[leaf_index].depth, 2);
        assert_eq!(graph.artifacts()[inner_index].depth, 1);
        assert_eq!(graph.artifacts()[outer_index].depth, 0);

        Ok(())
    }

    #[test]
    fn scan_errors() {
        let missing = BinaryScanner::new("/nonexistent/path/for/scan").scan();
        assert!(matches!(missing, Err(PipelineError::Scan(_))));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"docs only").unwrap();
        let empty = BinaryScanner::new(dir.path()).scan();
        assert!(matches!(empty, Err(PipelineError::Scan(_))));
    }

    #[test]
    fn root_may_itself_be_a_bundle() -> Result<(), PipelineError> {
        let dir = tempfile::tempdir()?;
        let bundle = write_bundle(dir.path(), "Solo.app", "Solo");

        let graph = BinaryScanner::new(&bundle).scan()?;

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.artifacts()[0].kind, ArtifactKind::Bundle);
        assert_eq!(graph.artifacts()[0].path, bundle);

        Ok(())
    }
}
