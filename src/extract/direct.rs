use std::io::{self, Read};
use std::path::Path;

use super::Materializer;
use crate::error::{Result, VaultError};
use crate::fsx as fs;

/// Restores with the process's own identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectMaterializer;

fn at(path: &Path) -> impl FnOnce(io::Error) -> VaultError + '_ {
    move |e| VaultError::io(e, path)
}

impl Materializer for DirectMaterializer {
    fn make_directory(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(at(path))
    }

    fn create_hard_link(&self, target: &Path, path: &Path) -> Result<()> {
        fs::remove_non_directory(path).map_err(at(path))?;
        fs::hard_link(target, path).map_err(at(path))
    }

    fn create_symlink(&self, target: &str, path: &Path) -> Result<()> {
        fs::remove_non_directory(path).map_err(at(path))?;
        std::os::unix::fs::symlink(target, path).map_err(at(path))
    }

    fn create_fifo(&self, path: &Path) -> Result<()> {
        fs::remove_non_directory(path).map_err(at(path))?;
        fs::make_fifo(path, 0o600).map_err(at(path))
    }

    fn write_file(&self, path: &Path, content: &mut dyn Read) -> Result<u64> {
        if self.is_symlink(path)? {
            fs::remove_file(path).map_err(at(path))?;
        }
        let mut file = fs::File::create(path).map_err(at(path))?;
        io::copy(content, &mut file).map_err(at(path))
    }

    fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_unix_permissions(path, mode).map_err(at(path))
    }

    fn set_mod_time(&self, path: &Path, secs: i64) -> Result<()> {
        fs::set_mod_time(path, secs).map_err(at(path))
    }

    fn is_symlink(&self, path: &Path) -> Result<bool> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(meta.file_type().is_symlink()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::io(e, path)),
        }
    }
}
