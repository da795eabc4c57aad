//! Turning a source bundle into a runnable artifact.
//!
//! The HTTP layer only knows the [`Builder`] trait. [`ToolchainBuilder`] is the
//! stock implementation: it unpacks the bundle into a scratch directory, runs
//! the configured toolchain (`cargo` unless configured otherwise) and zips the
//! resulting executables together with the bundle's `__resources/` tree.
//!
//! | Manifest command | Invocation (in `src/<package>`)                        | Executables from          |
//! |------------------|--------------------------------------------------------|---------------------------|
//! | `install`        | `<toolchain> install --path . --root <out> <flags>`    | `<out>/bin`               |
//! | `build`          | `<toolchain> build --target-dir <target> <flags>`      | `<target>/{release,debug}`|

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::bundle::{self, Manifest, RESOURCES_DIR, SOURCE_DIR};
use crate::config::BuildConfig;
use crate::error::BuildError;

/// Compiles a source bundle into an artifact archive.
pub trait Builder: Send + Sync {
    fn build(&self, bundle: Vec<u8>) -> BoxFuture<'_, Result<Vec<u8>, BuildError>>;
}

/// Builds bundles by shelling out to a cargo-compatible toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainBuilder {
    toolchain: String,
    timeout: Duration,
}

impl ToolchainBuilder {
    pub fn new(toolchain: impl Into<String>, timeout: Duration) -> Self {
        Self {
            toolchain: toolchain.into(),
            timeout,
        }
    }

    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(&config.toolchain, Duration::from_secs(config.timeout_secs))
    }

    async fn run(&self, bundle: Vec<u8>) -> Result<Vec<u8>, BuildError> {
        let manifest = bundle::read_manifest(&bundle)?;
        let command = BuildCommand::from_manifest(&manifest)?;
        let package = manifest.package_path()?;

        let scratch = tempfile::Builder::new().prefix("devfarm-build-").tempdir()?;
        let root = scratch.path().to_path_buf();
        blocking(move || bundle::extract(&bundle, &root).map_err(BuildError::from)).await??;

        let package_dir = scratch.path().join(SOURCE_DIR).join(&package);
        if !package_dir.is_dir() {
            return Err(BuildError::MissingPackage(manifest.packages.clone()));
        }

        let out_dir = scratch.path().join("out");
        let (args, bin_dir) = command.invocation(&out_dir, &manifest.build_flags);
        info!(
            "Building {} with `{} {}`",
            manifest.packages,
            self.toolchain,
            args.join(" ")
        );

        let child = tokio::process::Command::new(&self.toolchain)
            .args(&args)
            .current_dir(&package_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildError::Toolchain(self.toolchain.clone(), e))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BuildError::Timeout(self.timeout))??;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stdout));
            warn!("Build of {} failed ({})", manifest.packages, output.status);
            return Err(BuildError::Failed(text));
        }

        let executables = find_executables(&bin_dir)?;
        if executables.is_empty() {
            return Err(BuildError::NoArtifact);
        }
        debug!("Build produced {executables:?}");

        let resources = scratch.path().join(RESOURCES_DIR);
        let artifact = blocking(move || {
            bundle::write_artifact(&executables, Some(&resources)).map_err(BuildError::from)
        })
        .await??;
        info!("Build of {} finished, artifact {} bytes", manifest.packages, artifact.len());
        Ok(artifact)
    }
}

impl Builder for ToolchainBuilder {
    fn build(&self, bundle: Vec<u8>) -> BoxFuture<'_, Result<Vec<u8>, BuildError>> {
        self.run(bundle).boxed()
    }
}

/// The two supported manifest commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildCommand {
    Build,
    Install,
}

impl BuildCommand {
    fn from_manifest(manifest: &Manifest) -> Result<Self, BuildError> {
        match manifest.command.as_str() {
            "build" => Ok(Self::Build),
            "install" => Ok(Self::Install),
            other => Err(BuildError::UnsupportedCommand(other.to_string())),
        }
    }

    /// Toolchain arguments and the directory the executables will land in.
    fn invocation(self, out_dir: &Path, flags: &[String]) -> (Vec<String>, PathBuf) {
        let out = out_dir.to_string_lossy().into_owned();
        match self {
            Self::Install => {
                let mut args = vec!["install".into(), "--path".into(), ".".into(), "--root".into(), out];
                args.extend(flags.iter().cloned());
                (args, out_dir.join("bin"))
            }
            Self::Build => {
                let release = flags.iter().any(|f| f == "--release" || f == "-r");
                let mut args = vec!["build".into(), "--target-dir".into(), out];
                args.extend(flags.iter().cloned());
                let profile = if release { "release" } else { "debug" };
                (args, out_dir.join(profile))
            }
        }
    }
}

/// Regular executable files directly inside `dir`, sorted by name.
fn find_executables(dir: &Path) -> Result<Vec<PathBuf>, BuildError> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(Vec::new());
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() && is_executable(&entry.path(), &meta) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(unix)]
fn is_executable(_path: &Path, meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _meta: &std::fs::Metadata) -> bool {
    path.extension().is_some_and(|ext| ext == "exe")
}

/// Run filesystem-heavy work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, BuildError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildError::Io(std::io::Error::other(e)))
}
