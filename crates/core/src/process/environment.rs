//! Installation layout and the environment handed to worker processes

use crate::config::HOME_ENV;
use crate::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Name of the dynamic library search path variable on this platform
pub fn library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "Path"
    } else if cfg!(any(target_os = "solaris", target_os = "illumos")) {
        "LD_LIBRARY_PATH_64"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Directories under the installation home that make up an installation
#[derive(Debug, Clone)]
pub struct Installation {
    home: PathBuf,
}

impl Installation {
    /// Installation rooted at `home`
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Installation home
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Full path of `program` in `home/bin`
    pub fn program(&self, program: &str) -> PathBuf {
        self.home
            .join("bin")
            .join(format!("{}{}", program, std::env::consts::EXE_SUFFIX))
    }

    /// `home/lib` and `home/cots/lib` joined with the platform separator.
    /// Windows keeps its libraries in `bin`.
    pub fn library_path(&self) -> Result<OsString> {
        let sub_dir = if cfg!(windows) { "bin" } else { "lib" };
        let dirs = [self.home.join(sub_dir), self.home.join("cots").join(sub_dir)];
        std::env::join_paths(dirs.iter()).map_err(|e| {
            Error::Configuration(format!(
                "Cannot build library path for home {}: {}",
                self.home.display(),
                e
            ))
        })
    }

    /// Replace the inherited environment of `command` with the home and
    /// library path variables
    pub fn apply(&self, command: &mut Command) -> Result<()> {
        let library_path = self.library_path()?;
        tracing::debug!(
            "{}={} {}={}",
            HOME_ENV,
            self.home.display(),
            library_path_var(),
            library_path.to_string_lossy()
        );
        command
            .env_clear()
            .env(HOME_ENV, &self.home)
            .env(library_path_var(), library_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_layout() {
        let installation = Installation::new("/opt/engine");
        assert_eq!(library_path_var(), "LD_LIBRARY_PATH");
        assert_eq!(
            installation.library_path().unwrap(),
            OsString::from("/opt/engine/lib:/opt/engine/cots/lib")
        );
        assert_eq!(
            installation.program("prelert_autodetect_api"),
            PathBuf::from("/opt/engine/bin/prelert_autodetect_api")
        );
    }

    #[test]
    fn test_apply_sets_exactly_two_variables() {
        let installation = Installation::new("/opt/engine");
        let mut command = Command::new("true");
        command.env("INHERITED_ONLY_BY_ACCIDENT", "1");
        installation.apply(&mut command).unwrap();

        let mut names: Vec<String> = command
            .get_envs()
            .filter(|(_, value)| value.is_some())
            .map(|(name, _)| name.to_string_lossy().into_owned())
            .collect();
        names.sort();
        let mut expected = vec![HOME_ENV.to_string(), library_path_var().to_string()];
        expected.sort();
        assert_eq!(names, expected);
    }
}
