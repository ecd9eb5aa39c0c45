//! Locating the packaged assistant relative to the launcher's install.
//!
//! Packaged installs place the assistant bundle next to the launcher's own
//! directory (`<launcher>/../vai/ai`). Development checkouts keep it under
//! `dist/`. The first candidate that exists wins.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::subprocess::SupervisorError;

/// Default bundle directory name.
pub const DEFAULT_BUNDLE: &str = "vai";

/// Default executable stem inside the bundle.
pub const DEFAULT_EXECUTABLE: &str = "ai";

/// Install layout rooted at the directory holding the launcher binary.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    exe_dir: PathBuf,
    bundle: String,
    executable: String,
}

impl InstallLayout {
    pub fn new(exe_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe_dir: exe_dir.into(),
            bundle: DEFAULT_BUNDLE.to_string(),
            executable: DEFAULT_EXECUTABLE.to_string(),
        }
    }

    /// Layout for the currently running binary.
    pub fn from_current_exe() -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe()?;
        let dir = exe.parent().ok_or_else(|| SupervisorError::InvalidRequest {
            reason: format!("launcher binary {} has no parent directory", exe.display()),
        })?;
        Ok(Self::new(dir))
    }

    #[must_use]
    pub fn with_bundle(mut self, bundle: &str) -> Self {
        bundle.clone_into(&mut self.bundle);
        self
    }

    #[must_use]
    pub fn with_executable(mut self, name: &str) -> Self {
        name.clone_into(&mut self.executable);
        self
    }

    fn file_name(&self) -> String {
        format!("{}{}", self.executable, std::env::consts::EXE_SUFFIX)
    }

    fn bundle_dirs(&self) -> [PathBuf; 3] {
        [
            self.exe_dir.join("..").join(&self.bundle),
            self.exe_dir.join(&self.bundle),
            self.exe_dir.join("dist").join(&self.bundle),
        ]
    }

    /// Candidate executable paths in lookup order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let name = self.file_name();
        self.bundle_dirs().iter().map(|d| d.join(&name)).collect()
    }

    /// First existing candidate, or `ExecutableNotFound` naming the primary
    /// location.
    pub fn resolve(&self) -> Result<PathBuf, SupervisorError> {
        let candidates = self.candidates();
        for candidate in &candidates {
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Resolved assistant executable");
                return Ok(normalize(candidate));
            }
        }
        Err(SupervisorError::ExecutableNotFound {
            path: normalize(&candidates[0]),
        })
    }

    /// Default location of the launch arguments file inside the bundle.
    pub fn args_file(&self) -> PathBuf {
        let bundle = self
            .bundle_dirs()
            .into_iter()
            .find(|d| d.is_dir())
            .unwrap_or_else(|| self.exe_dir.join("..").join(&self.bundle));
        normalize(&bundle.join("_internal").join("args.json"))
    }
}

/// Resolve `..` when the path exists; keep it as-is otherwise.
fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
