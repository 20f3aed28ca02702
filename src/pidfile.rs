use crate::error::Error;
use log::debug;
use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

/// Holds our process id in a file for as long as it lives
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, Error> {
        fs::write(path, format!("{}\n", process::id()))
            .map_err(|e| Error::io(format!("cannot write pid file {}", path.display()), e))?;

        debug!("{}: pid {}", path.display(), process::id());

        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
