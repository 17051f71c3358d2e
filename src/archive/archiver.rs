//! Walks include roots and synthesises a tar.gz byte stream.
//!
//! The walk is depth-first with deterministic (name-sorted) ordering.
//! Excluded directories are pruned before descent. Unreadable descendants
//! are logged and skipped; unreadable roots and unsafe paths are fatal.
//! Whatever happens, the gzip trailer is emitted so a cancelled walk never
//! leaves a truncated-without-trailer artifact.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::GlobBuilder;
use log::{debug, warn};
use tar::{Builder, EntryType, Header};
use walkdir::{DirEntry, WalkDir};

use crate::archive::ExcludeSet;
use crate::cancel::CancelToken;

pub struct Archiver {
    includes: Vec<String>,
    excludes: ExcludeSet,
}

impl Archiver {
    /// Create an archiver for the given roots and exclude patterns.
    /// Pattern compilation errors surface here.
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        if includes.is_empty() {
            bail!("at least one include path is required");
        }

        Ok(Self {
            includes: includes.to_vec(),
            excludes: ExcludeSet::new(excludes)?,
        })
    }

    /// Write a complete tar.gz archive of all include roots into `sink`.
    ///
    /// Returns once the sink holds a well-formed archive, or an error on
    /// unrecoverable I/O or cancellation. The gzip trailer is emitted even
    /// on the error paths.
    pub fn archive<W: Write>(&self, sink: W, cancel: &CancelToken) -> Result<()> {
        let encoder = GzEncoder::new(sink, Compression::default());
        let mut builder = Builder::new(encoder);

        let walk_result = (|| {
            for include in &self.includes {
                self.archive_root(&mut builder, include, cancel)
                    .with_context(|| format!("failed to archive {}", include))?;
            }
            Ok(())
        })();

        match walk_result {
            Ok(()) => {
                let encoder = builder
                    .into_inner()
                    .context("failed to finalize tar stream")?;
                encoder
                    .finish()
                    .context("failed to finalize gzip stream")?;
                Ok(())
            }
            Err(err) => {
                // Close the compressed stream cleanly before surfacing the
                // walk error.
                if let Ok(encoder) = builder.into_inner() {
                    let _ = encoder.finish();
                }
                Err(err)
            }
        }
    }

    fn archive_root<W: Write>(
        &self,
        builder: &mut Builder<GzEncoder<W>>,
        include: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let root_name = root_archive_name(include)?;
        let root = Path::new(include);

        let walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
        let entries = walker.into_iter().filter_entry(|entry| {
            !self
                .excludes
                .is_match(&entry_archive_path(root, &root_name, entry.path()))
        });

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(CancelToken::error());
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        return Err(anyhow!(err).context("failed to read include root"));
                    }
                    warn!("Skipping unreadable path: {}", err);
                    continue;
                }
            };

            let archive_path = entry_archive_path(root, &root_name, entry.path());
            self.append_entry(builder, &entry, &archive_path)?;
        }

        Ok(())
    }

    fn append_entry<W: Write>(
        &self,
        builder: &mut Builder<GzEncoder<W>>,
        entry: &DirEntry,
        archive_path: &str,
    ) -> Result<()> {
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("Skipping {}: failed to stat: {}", archive_path, err);
                return Ok(());
            }
        };

        let file_type = entry.file_type();
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if file_type.is_dir() {
            let mut header = base_header(EntryType::Directory, file_mode(&metadata, true), mtime, 0);
            builder
                .append_data(&mut header, format!("{}/", archive_path), io::empty())
                .with_context(|| format!("failed to write directory header for {}", archive_path))?;
        } else if file_type.is_file() {
            let file = match File::open(entry.path()) {
                Ok(file) => file,
                Err(err) => {
                    // Vanished or unreadable between stat and open.
                    warn!("Skipping unreadable file {}: {}", archive_path, err);
                    return Ok(());
                }
            };
            debug!("Adding {} ({} bytes)", archive_path, metadata.len());
            let mut header = base_header(
                EntryType::Regular,
                file_mode(&metadata, false),
                mtime,
                metadata.len(),
            );
            builder
                .append_data(&mut header, archive_path, file)
                .with_context(|| format!("failed to write file {}", archive_path))?;
        } else if file_type.is_symlink() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(target) => target,
                Err(err) => {
                    warn!("Skipping unreadable symlink {}: {}", archive_path, err);
                    return Ok(());
                }
            };
            let mut header = base_header(EntryType::Symlink, file_mode(&metadata, false), mtime, 0);
            builder
                .append_link(&mut header, archive_path, &target)
                .with_context(|| format!("failed to write symlink {}", archive_path))?;
        } else {
            // Devices, FIFOs and sockets have no place in a backup archive.
            warn!("Skipping unsupported file type: {}", archive_path);
        }

        Ok(())
    }

    /// Sum of regular-file sizes that would enter the archive. Used for
    /// the pre-flight summary; the uploaded size still counts as unknown
    /// because compression and encryption change it.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for include in &self.includes {
            let root_name = root_archive_name(include)?;
            let root = Path::new(include);

            let walker = WalkDir::new(root).follow_links(false);
            let entries = walker.into_iter().filter_entry(|entry| {
                !self
                    .excludes
                    .is_match(&entry_archive_path(root, &root_name, entry.path()))
            });

            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        if err.depth() == 0 {
                            return Err(anyhow!(err)
                                .context(format!("failed to read include root {}", include)));
                        }
                        continue;
                    }
                };
                if entry.file_type().is_file() {
                    if let Ok(metadata) = entry.metadata() {
                        total += metadata.len();
                    }
                }
            }
        }

        Ok(total)
    }
}

/// The archive name of an include root: the path as given, in
/// forward-slash form with any leading `/` stripped.
///
/// A `..` segment is rejected so traversal-style paths can never appear
/// inside the archive.
fn root_archive_name(include: &str) -> Result<String> {
    let mut segments = Vec::new();
    for component in Path::new(include).components() {
        match component {
            Component::Normal(name) => segments.push(name.to_string_lossy().into_owned()),
            Component::ParentDir => {
                bail!("unsafe path {}: contains '..'", include)
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }

    if segments.is_empty() {
        bail!("include path {} resolves to an empty archive name", include);
    }
    Ok(segments.join("/"))
}

/// Archive-relative path of a walked node, always forward-slash.
fn entry_archive_path(root: &Path, root_name: &str, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut result = root_name.to_string();
    for component in rel.components() {
        if let Component::Normal(name) = component {
            result.push('/');
            result.push_str(&name.to_string_lossy());
        }
    }
    result
}

fn base_header(entry_type: EntryType, mode: u32, mtime: u64, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata, is_dir: bool) -> u32 {
    if is_dir {
        0o755
    } else {
        0o644
    }
}

/// Expand include arguments that contain shell-style wildcards into the
/// matching paths, and check that literal paths exist.
pub fn resolve_includes(includes: &[String]) -> Result<Vec<String>> {
    let mut resolved = Vec::new();

    for include in includes {
        if include.chars().any(|c| matches!(c, '*' | '?' | '[' | '{')) {
            let matches = expand_pattern(include)?;
            if matches.is_empty() {
                bail!("no matches found for pattern: {}", include);
            }
            resolved.extend(matches);
        } else {
            if !Path::new(include).exists() {
                bail!("path not found: {}", include);
            }
            resolved.push(include.clone());
        }
    }

    Ok(resolved)
}

/// Component-wise wildcard expansion against the filesystem, like shell
/// globbing. `*` never crosses a separator.
fn expand_pattern(pattern: &str) -> Result<Vec<String>> {
    let mut stems: Vec<PathBuf> = vec![PathBuf::new()];

    for component in Path::new(pattern).components() {
        match component {
            Component::RootDir => {
                stems = vec![PathBuf::from("/")];
            }
            Component::Prefix(prefix) => {
                stems = vec![PathBuf::from(prefix.as_os_str())];
            }
            Component::CurDir => {
                stems = stems.iter().map(|s| s.join(".")).collect();
            }
            Component::ParentDir => {
                // Rejected later by the archiver's path validation.
                stems = stems.iter().map(|s| s.join("..")).collect();
            }
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                if name.chars().any(|c| matches!(c, '*' | '?' | '[' | '{')) {
                    let matcher = GlobBuilder::new(&name)
                        .literal_separator(true)
                        .build()
                        .with_context(|| format!("failed to compile pattern {}", pattern))?
                        .compile_matcher();

                    let mut expanded = Vec::new();
                    for stem in &stems {
                        let dir = if stem.as_os_str().is_empty() {
                            Path::new(".")
                        } else {
                            stem.as_path()
                        };
                        let entries = match std::fs::read_dir(dir) {
                            Ok(entries) => entries,
                            Err(_) => continue,
                        };
                        for entry in entries.flatten() {
                            if matcher.is_match(entry.file_name().to_string_lossy().as_ref()) {
                                expanded.push(stem.join(entry.file_name()));
                            }
                        }
                    }
                    expanded.sort();
                    stems = expanded;
                } else {
                    stems = stems.iter().map(|s| s.join(name.as_ref())).collect();
                }
            }
        }
        if stems.is_empty() {
            return Ok(Vec::new());
        }
    }

    Ok(stems
        .into_iter()
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().into_owned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn archiver_for(root: &Path, excludes: &[&str]) -> Archiver {
        let includes = vec![root.to_string_lossy().into_owned()];
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        Archiver::new(&includes, &excludes).unwrap()
    }

    fn entry_names(archive_bytes: &[u8]) -> Vec<String> {
        let decoder = flate2::read::GzDecoder::new(archive_bytes);
        let mut archive = tar::Archive::new(decoder);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    #[test]
    fn test_root_archive_name_strips_leading_slash() {
        assert_eq!(root_archive_name("/var/data").unwrap(), "var/data");
        assert_eq!(root_archive_name("var/data/").unwrap(), "var/data");
    }

    #[test]
    fn test_root_archive_name_rejects_parent_segments() {
        assert!(root_archive_name("../etc").is_err());
        assert!(root_archive_name("data/../../etc").is_err());
    }

    #[test]
    fn test_root_archive_name_rejects_empty() {
        assert!(root_archive_name("/").is_err());
        assert!(root_archive_name(".").is_err());
    }

    #[test]
    fn test_requires_includes() {
        assert!(Archiver::new(&[], &[]).is_err());
    }

    #[test]
    fn test_invalid_exclude_pattern_fails_at_construction() {
        let includes = vec![".".to_string()];
        let excludes = vec!["[".to_string()];
        assert!(Archiver::new(&includes, &excludes).is_err());
    }

    #[test]
    fn test_archives_files_and_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"Hello").unwrap();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir").join("b.txt"), b"World").unwrap();

        let archiver = archiver_for(&root, &[]);
        let mut out = Vec::new();
        archiver.archive(&mut out, &CancelToken::new()).unwrap();

        let names = entry_names(&out);
        let root_name = root_archive_name(&root.to_string_lossy()).unwrap();
        assert!(names.contains(&format!("{}/", root_name)));
        assert!(names.contains(&format!("{}/a.txt", root_name)));
        assert!(names.contains(&format!("{}/dir/", root_name)));
        assert!(names.contains(&format!("{}/dir/b.txt", root_name)));
    }

    #[test]
    fn test_empty_root_produces_valid_archive() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("empty");
        fs::create_dir(&root).unwrap();

        let archiver = archiver_for(&root, &[]);
        let mut out = Vec::new();
        archiver.archive(&mut out, &CancelToken::new()).unwrap();

        assert!(!out.is_empty());
        let names = entry_names(&out);
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with('/'));
    }

    #[test]
    fn test_excluded_directory_is_pruned() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir_all(root.join("node_modules").join("pkg")).unwrap();
        fs::write(root.join("node_modules").join("pkg").join("x.js"), b"x").unwrap();
        fs::write(root.join("keep.txt"), b"keep").unwrap();

        let archiver = archiver_for(&root, &["node_modules/**"]);
        let mut out = Vec::new();
        archiver.archive(&mut out, &CancelToken::new()).unwrap();

        let names = entry_names(&out);
        assert!(names.iter().any(|n| n.ends_with("keep.txt")));
        assert!(!names.iter().any(|n| n.contains("node_modules")));
    }

    #[test]
    fn test_file_contents_round_trip() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("file.bin"), b"binary\x00content").unwrap();

        let archiver = archiver_for(&root, &[]);
        let mut out = Vec::new();
        archiver.archive(&mut out, &CancelToken::new()).unwrap();

        let decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy().ends_with("file.bin") {
                let mut content = Vec::new();
                std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
                assert_eq!(content, b"binary\x00content");
                found = true;
            }
        }
        assert!(found);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_entry() {
        use std::os::unix::fs::symlink;

        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("target.txt"), b"t").unwrap();
        symlink("target.txt", root.join("link")).unwrap();

        let archiver = archiver_for(&root, &[]);
        let mut out = Vec::new();
        archiver.archive(&mut out, &CancelToken::new()).unwrap();

        let decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut archive = tar::Archive::new(decoder);
        let mut found = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy().ends_with("link") {
                assert_eq!(entry.header().entry_type(), EntryType::Symlink);
                assert_eq!(
                    entry.link_name().unwrap().unwrap().to_string_lossy(),
                    "target.txt"
                );
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_cancelled_walk_still_emits_gzip_trailer() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        let archiver = archiver_for(&root, &[]);
        let mut out = Vec::new();
        let err = archiver.archive(&mut out, &cancel).unwrap_err();
        assert!(crate::cancel::is_cancelled(&err));

        // The stream must still decode as a complete gzip member.
        let mut decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut decoded).unwrap();
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let archiver = Archiver::new(&["definitely-missing-root".to_string()], &[]).unwrap();
        let mut out = Vec::new();
        assert!(archiver.archive(&mut out, &CancelToken::new()).is_err());
    }

    #[test]
    fn test_total_size_skips_excluded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("keep.txt"), b"12345").unwrap();
        fs::write(root.join("skip.log"), b"123456789").unwrap();

        let archiver = archiver_for(&root, &["*.log"]);
        assert_eq!(archiver.total_size().unwrap(), 5);
    }

    #[test]
    fn test_resolve_includes_literal_path() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        fs::write(&file, b"a").unwrap();

        let resolved =
            resolve_includes(&[file.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_resolve_includes_missing_path() {
        assert!(resolve_includes(&["missing-path-xyz".to_string()]).is_err());
    }

    #[test]
    fn test_resolve_includes_expands_wildcards() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::write(temp.path().join("b.txt"), b"b").unwrap();
        fs::write(temp.path().join("c.log"), b"c").unwrap();

        let pattern = temp.path().join("*.txt").to_string_lossy().into_owned();
        let resolved = resolve_includes(&[pattern]).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|p| p.ends_with(".txt")));
    }

    #[test]
    fn test_resolve_includes_no_match_is_error() {
        let temp = TempDir::new().unwrap();
        let pattern = temp.path().join("*.none").to_string_lossy().into_owned();
        assert!(resolve_includes(&[pattern]).is_err());
    }
}
