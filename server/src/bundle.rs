//! Zip codec for source bundles and build artifacts.
//!
//! A **source bundle** (what the client submits) holds:
//!
//! ```text
//! manifest.json        {"command": "build", "build_flags": [..], "packages": "app"}
//! src/<package>/...    package source tree
//! __resources/...      optional runtime files
//! ```
//!
//! An **artifact** (what the builder hands to the runner) holds the built
//! executables at the archive root plus the same `__resources/` tree.
//!
//! Every entry name is checked with [`zip::read::ZipFile::enclosed_name`]
//! before anything touches the filesystem; absolute names and `..` escapes are
//! rejected with [`BundleError::UnsafePath`].

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::BundleError;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const SOURCE_DIR: &str = "src";
pub const RESOURCES_DIR: &str = "__resources";

/// Build instructions carried inside a source bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// `build` or `install`.
    pub command: String,
    #[serde(default)]
    pub build_flags: Vec<String>,
    /// Package path relative to `src/`.
    pub packages: String,
}

impl Manifest {
    /// The package path, checked to stay inside `src/`.
    pub fn package_path(&self) -> Result<PathBuf, BundleError> {
        let path = Path::new(&self.packages);
        let safe = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe || self.packages.is_empty() {
            return Err(BundleError::UnsafePath(self.packages.clone()));
        }
        Ok(path.to_path_buf())
    }
}

/// Parse `manifest.json` out of a source bundle without extracting anything.
pub fn read_manifest(bundle: &[u8]) -> Result<Manifest, BundleError> {
    let mut archive = ZipArchive::new(Cursor::new(bundle))?;
    let mut entry = match archive.by_name(MANIFEST_NAME) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(BundleError::MissingManifest),
        Err(e) => return Err(e.into()),
    };
    let mut raw = Vec::new();
    entry.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Extract every entry of `archive` below `dest`.
///
/// Returns the relative paths of the extracted files in archive order. Unix
/// permission bits stored in the archive are restored.
pub fn extract(archive: &[u8], dest: &Path) -> Result<Vec<PathBuf>, BundleError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))?;
    let mut files = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(BundleError::UnsafePath(entry.name().to_string()));
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        files.push(relative);
    }
    Ok(files)
}

/// Package built executables and an optional resources directory as an
/// artifact archive.
pub fn write_artifact(executables: &[PathBuf], resources: Option<&Path>) -> Result<Vec<u8>, BundleError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let exec_opts = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);

    for path in executables {
        let Some(name) = path.file_name() else { continue };
        zip.start_file(name.to_string_lossy(), exec_opts)?;
        let mut input = fs::File::open(path)?;
        std::io::copy(&mut input, &mut zip)?;
    }

    if let Some(dir) = resources.filter(|d| d.is_dir()) {
        add_tree(&mut zip, dir, RESOURCES_DIR)?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Recursively add `dir` under `prefix/` in the archive.
fn add_tree(zip: &mut ZipWriter<Cursor<Vec<u8>>>, dir: &Path, prefix: &str) -> Result<(), BundleError> {
    let opts = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    zip.add_directory(format!("{prefix}/"), opts)?;

    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);
    for entry in entries {
        let name = format!("{prefix}/{}", entry.file_name().to_string_lossy());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            add_tree(zip, &entry.path(), &name)?;
        } else if file_type.is_file() {
            zip.start_file(name, opts)?;
            let mut input = fs::File::open(entry.path())?;
            std::io::copy(&mut input, zip)?;
        }
    }
    Ok(())
}

/// Write a single-entry-per-item archive from in-memory contents.
///
/// Each item is `(name, bytes, unix_mode)`. Used to assemble bundles in tests
/// and by builders that already hold their outputs in memory.
pub fn archive_from_entries(entries: &[(&str, &[u8], u32)]) -> Result<Vec<u8>, BundleError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data, mode) in entries {
        let opts = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(*mode);
        zip.start_file(*name, opts)?;
        zip.write_all(data)?;
    }
    Ok(zip.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_bundle(manifest: &str) -> Vec<u8> {
        archive_from_entries(&[
            (MANIFEST_NAME, manifest.as_bytes(), 0o644),
            ("src/app/Cargo.toml", b"[package]\nname = \"app\"\n", 0o644),
            ("src/app/src/main.rs", b"fn main() {}\n", 0o644),
            ("__resources/data.txt", b"payload", 0o644),
        ])
        .unwrap()
    }

    #[test]
    fn reads_manifest() {
        let bundle =
            source_bundle(r#"{"command":"build","build_flags":["--release"],"packages":"app"}"#);
        let manifest = read_manifest(&bundle).unwrap();
        assert_eq!(manifest.command, "build");
        assert_eq!(manifest.build_flags, vec!["--release".to_string()]);
        assert_eq!(manifest.package_path().unwrap(), PathBuf::from("app"));
    }

    #[test]
    fn build_flags_default_to_empty() {
        let bundle = source_bundle(r#"{"command":"install","packages":"app"}"#);
        assert!(read_manifest(&bundle).unwrap().build_flags.is_empty());
    }

    #[test]
    fn missing_manifest_is_reported() {
        let bundle = archive_from_entries(&[("src/app/main.rs", b"", 0o644)]).unwrap();
        assert!(matches!(read_manifest(&bundle), Err(BundleError::MissingManifest)));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(matches!(
            read_manifest(b"definitely not a zip"),
            Err(BundleError::Archive(_))
        ));
    }

    #[test]
    fn package_path_may_not_escape() {
        for bad in ["../outside", "/etc", ""] {
            let manifest = Manifest {
                command: "build".into(),
                build_flags: vec![],
                packages: bad.into(),
            };
            assert!(manifest.package_path().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn extracts_tree_in_archive_order() {
        let bundle = source_bundle(r#"{"command":"build","packages":"app"}"#);
        let dir = tempfile::tempdir().unwrap();
        let files = extract(&bundle, dir.path()).unwrap();
        assert_eq!(files[0], PathBuf::from(MANIFEST_NAME));
        assert_eq!(
            fs::read_to_string(dir.path().join("__resources/data.txt")).unwrap(),
            "payload"
        );
        assert!(dir.path().join("src/app/src/main.rs").is_file());
    }

    #[test]
    fn rejects_escaping_entries() {
        let bundle = archive_from_entries(&[("../evil.sh", b"boom", 0o755)]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract(&bundle, dir.path()),
            Err(BundleError::UnsafePath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn artifact_keeps_executables_runnable() {
        use std::os::unix::fs::PermissionsExt;

        let build = tempfile::tempdir().unwrap();
        let exe = build.path().join("app");
        fs::write(&exe, b"#!/bin/sh\necho hi\n").unwrap();
        let res = build.path().join("res");
        fs::create_dir_all(res.join("nested")).unwrap();
        fs::write(res.join("nested/cfg.toml"), b"x = 1").unwrap();

        let artifact = write_artifact(&[exe], Some(&res)).unwrap();
        let run = tempfile::tempdir().unwrap();
        let files = extract(&artifact, run.path()).unwrap();

        assert_eq!(files[0], PathBuf::from("app"));
        let mode = fs::metadata(run.path().join("app")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(run.path().join("__resources/nested/cfg.toml").is_file());
    }
}
