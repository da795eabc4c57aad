//! Source bundle packer.
//!
//! [`pack`] turns a package directory in the local workspace into the zip
//! bundle accepted by `POST /api/spaces`:
//!
//! ```text
//! manifest.json            {"command", "build_flags", "packages"}
//! src/<package>/...        package sources
//! __resources/...          optional runtime resources (program CWD)
//! ```
//!
//! Build output and VCS metadata (`target/`, `.git/`) are never shipped.

use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use walkdir::{DirEntry, WalkDir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const MANIFEST_NAME: &str = "manifest.json";
const SOURCE_DIR: &str = "src";
const RESOURCES_DIR: &str = "__resources";

/// Directories skipped while walking the package tree. The resources tree is
/// shipped as is.
const SKIPPED_DIRS: &[&str] = &["target", ".git", RESOURCES_DIR];

/// Commands the server knows how to build.
const COMMANDS: &[&str] = &["build", "install"];

/// Errors produced while packing a bundle.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("package path must be relative and stay inside the workspace: {0}")]
    UnsafePackage(String),
    #[error("package directory not found: {}", .0.display())]
    MissingPackage(PathBuf),
    #[error("resources directory not found: {}", .0.display())]
    MissingResources(PathBuf),
    #[error("walking {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest encoding failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Manifest<'a> {
    command: &'a str,
    build_flags: &'a [String],
    packages: String,
}

/// Pack `package` (relative to `working_dir`) plus optional `resources` into
/// a source bundle.
pub fn pack(
    working_dir: &Path,
    command: &str,
    flags: &[String],
    package: &str,
    resources: Option<&Path>,
) -> Result<Vec<u8>, PackError> {
    if !COMMANDS.contains(&command) {
        return Err(PackError::UnsupportedCommand(command.to_string()));
    }
    let package = normalize_package(package)?;
    let package_dir = working_dir.join(&package);
    if !package_dir.is_dir() {
        return Err(PackError::MissingPackage(package_dir));
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    let manifest = Manifest {
        command,
        build_flags: flags,
        packages: package.clone(),
    };
    zip.start_file(MANIFEST_NAME, options(0o644))?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

    let src_prefix = if package == "." {
        SOURCE_DIR.to_string()
    } else {
        format!("{SOURCE_DIR}/{package}")
    };
    add_tree(&mut zip, &package_dir, &src_prefix, SKIPPED_DIRS)?;

    if let Some(dir) = resources {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            working_dir.join(dir)
        };
        if !dir.is_dir() {
            return Err(PackError::MissingResources(dir));
        }
        add_tree(&mut zip, &dir, RESOURCES_DIR, &[])?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Forward-slash form of a relative package path; `.` for the workspace root.
fn normalize_package(package: &str) -> Result<String, PackError> {
    let unsafe_package = || PackError::UnsafePackage(package.to_string());
    let mut parts = Vec::new();
    for component in Path::new(package).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(unsafe_package)?),
            Component::CurDir => {}
            _ => return Err(unsafe_package()),
        }
    }
    if parts.is_empty() {
        return Ok(".".to_string());
    }
    Ok(parts.join("/"))
}

fn skipped(entry: &DirEntry, skip: &[&str]) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| skip.contains(&name))
}

/// Add every regular file under `root` as `<prefix>/<relative path>`,
/// leaving out directories named in `skip`.
fn add_tree<W: Write + std::io::Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    prefix: &str,
    skip: &[&str],
) -> Result<(), PackError> {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skipped(e, skip));

    for entry in walker {
        let entry = entry.map_err(|source| PackError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        let name = format!("{prefix}/{}", rel.join("/"));

        zip.start_file(name, options(file_mode(&entry)?))?;
        let mut file = std::fs::File::open(entry.path())?;
        std::io::copy(&mut file, zip)?;
    }
    Ok(())
}

fn file_mode(entry: &DirEntry) -> std::io::Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(entry.metadata().map_err(std::io::Error::other)?.permissions().mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = entry;
        Ok(0o644)
    }
}

fn options(mode: u32) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("apps/hello");
        std::fs::create_dir_all(pkg.join("src")).unwrap();
        std::fs::create_dir_all(pkg.join("target/debug")).unwrap();
        std::fs::create_dir_all(pkg.join(".git")).unwrap();
        std::fs::write(pkg.join("Cargo.toml"), "[package]\nname = \"hello\"\n").unwrap();
        std::fs::write(pkg.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(pkg.join("target/debug/hello"), "binary").unwrap();
        std::fs::write(pkg.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("assets/img")).unwrap();
        std::fs::write(dir.path().join("assets/img/logo.txt"), "logo").unwrap();
        dir
    }

    fn names(bundle: &[u8]) -> Vec<String> {
        let archive = ZipArchive::new(Cursor::new(bundle)).unwrap();
        archive.file_names().map(String::from).collect()
    }

    fn read_entry(bundle: &[u8], name: &str) -> String {
        let mut archive = ZipArchive::new(Cursor::new(bundle)).unwrap();
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn packs_sources_and_manifest() {
        let ws = workspace();
        let flags = vec!["--release".to_string()];
        let bundle = pack(ws.path(), "build", &flags, "./apps/hello", None).unwrap();

        let mut entries = names(&bundle);
        entries.sort();
        assert_eq!(
            entries,
            vec![
                "manifest.json",
                "src/apps/hello/Cargo.toml",
                "src/apps/hello/src/main.rs",
            ]
        );

        let manifest: serde_json::Value =
            serde_json::from_str(&read_entry(&bundle, "manifest.json")).unwrap();
        assert_eq!(manifest["command"], "build");
        assert_eq!(manifest["build_flags"][0], "--release");
        assert_eq!(manifest["packages"], "apps/hello");
    }

    #[test]
    fn includes_resources_under_reserved_dir() {
        let ws = workspace();
        let bundle = pack(ws.path(), "install", &[], "apps/hello", Some(Path::new("assets"))).unwrap();
        assert_eq!(read_entry(&bundle, "__resources/img/logo.txt"), "logo");
    }

    #[test]
    fn resources_keep_directories_the_package_walk_skips() {
        let ws = workspace();
        let assets = ws.path().join("assets");
        std::fs::create_dir_all(assets.join("target")).unwrap();
        std::fs::create_dir_all(assets.join(".git")).unwrap();
        std::fs::write(assets.join("target/keep.txt"), "kept").unwrap();
        std::fs::write(assets.join(".git/config"), "cfg").unwrap();

        let bundle = pack(ws.path(), "build", &[], "apps/hello", Some(Path::new("assets"))).unwrap();
        assert_eq!(read_entry(&bundle, "__resources/target/keep.txt"), "kept");
        assert_eq!(read_entry(&bundle, "__resources/.git/config"), "cfg");
        assert!(!names(&bundle).iter().any(|n| n.starts_with("src/apps/hello/target/")));
    }

    #[test]
    fn workspace_root_package() {
        let ws = workspace();
        let bundle = pack(&ws.path().join("apps/hello"), "build", &[], ".", None).unwrap();
        assert!(names(&bundle).contains(&"src/src/main.rs".to_string()));
        let manifest: serde_json::Value =
            serde_json::from_str(&read_entry(&bundle, "manifest.json")).unwrap();
        assert_eq!(manifest["packages"], ".");
    }

    #[test]
    fn rejects_bad_input() {
        let ws = workspace();
        assert!(matches!(
            pack(ws.path(), "test", &[], "apps/hello", None),
            Err(PackError::UnsupportedCommand(c)) if c == "test"
        ));
        assert!(matches!(
            pack(ws.path(), "build", &[], "../elsewhere", None),
            Err(PackError::UnsafePackage(_))
        ));
        assert!(matches!(
            pack(ws.path(), "build", &[], "/abs", None),
            Err(PackError::UnsafePackage(_))
        ));
        assert!(matches!(
            pack(ws.path(), "build", &[], "apps/missing", None),
            Err(PackError::MissingPackage(_))
        ));
        assert!(matches!(
            pack(ws.path(), "build", &[], "apps/hello", Some(Path::new("nope"))),
            Err(PackError::MissingResources(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn keeps_file_modes() {
        use std::os::unix::fs::PermissionsExt;
        let ws = workspace();
        let script = ws.path().join("apps/hello/run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bundle = pack(ws.path(), "build", &[], "apps/hello", None).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bundle)).unwrap();
        let entry = archive.by_name("src/apps/hello/run.sh").unwrap();
        assert_eq!(entry.unix_mode().map(|m| m & 0o777), Some(0o755));
    }
}
