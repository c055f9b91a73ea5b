use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Run is already leased by {holder:?}, remove {path:?} if that process is gone")]
    Held { path: PathBuf, holder: String },
    #[error("Failed to create lease {path:?}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive claim on a run directory, released on drop.
///
/// Creation uses `O_CREAT | O_EXCL`, so two orchestrators racing for the same
/// run cannot both succeed.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
}

fn holder_name() -> String {
    let host = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());

    format!("{host}:{}", std::process::id())
}

impl Lease {
    pub fn acquire(path: &Path) -> Result<Self, LeaseError> {
        let holder = holder_name();
        let lease = Self::claim(path, |file| file.write_all(holder.as_bytes()))?;
        debug!(path = ?path, holder = %holder, "Acquired run lease");

        Ok(lease)
    }

    /// Create the lease file and let `write_holder` fill it in.
    ///
    /// The guard exists before anything is written, a failed write removes
    /// the file again instead of leaving an anonymous lease behind.
    fn claim<F>(path: &Path, write_holder: F) -> Result<Self, LeaseError>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                error!(
                    path = ?path,
                    holder = %holder,
                    "Run is leased by another orchestrator, delete the lease file if that process is gone"
                );

                return Err(LeaseError::Held {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(source) => {
                return Err(LeaseError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let lease = Self {
            path: path.to_path_buf(),
        };

        write_holder(&mut file).map_err(|source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(lease)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released run lease"),
            Err(error) => error!(error = ?error, "Failed to release run lease"),
        }
    }
}
