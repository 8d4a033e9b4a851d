use log::info;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const DATA_DIR_NAME: &str = "forecast_warehouse";

pub fn get_data_dir() -> io::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Could not determine system data directory",
            )
        })
        .map(|p| p.join(DATA_DIR_NAME))
}

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("Path exists but is not a directory: {}", path.display()),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Creating directory: {}", path.display());
            std::fs::create_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

/// Writes `bytes` to `path` so that readers either see the previous state or the full
/// content, never a prefix: the data goes to a temp file in the same directory which is
/// then renamed over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir_exists(dir)?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(bytes)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"first version").unwrap();
        write_atomic(&path, b"v2").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"v2");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(leftovers.len(), 1, "temp files must not linger");
    }

    #[test]
    fn test_ensure_dir_rejects_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_dir_exists(&file).is_err());
        assert!(ensure_dir_exists(&dir.path().join("a/b")).is_ok());
    }
}
