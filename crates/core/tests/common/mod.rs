//! Fake installation homes with shell-script workers

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const AUTODETECT: &str = "prelert_autodetect_api";
pub const NORMALIZE: &str = "prelert_normalize_api";

/// Worker that swallows its input and exits cleanly when stdin closes
pub const CONSUME_INPUT: &str = "#!/bin/sh\nexec /bin/cat > /dev/null\n";

/// An installation home with `bin/`, `lib/` and `config/` directories
pub struct FakeHome {
    pub dir: TempDir,
}

impl FakeHome {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["bin", "lib", "config", "tmp"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    /// Install `script` as the program `name`
    #[cfg(unix)]
    pub fn install(&self, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;

        let path = self.dir.path().join("bin").join(name);
        let staging = self.dir.path().join(format!("{}.new", name));
        fs::write(&staging, script).unwrap();
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755)).unwrap();
        fs::rename(&staging, &path).unwrap();
    }

    /// Number of entries left in the temp dir
    pub fn temp_entries(&self) -> usize {
        fs::read_dir(self.temp_dir()).unwrap().count()
    }
}
