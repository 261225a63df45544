use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub fn ensure_directory<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)?;
        tracing::info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Sibling path with `suffix` appended to the full file name,
/// e.g. `model.pth` + `partial` -> `model.pth.partial`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `file_path` with `content` through a temporary sibling and a rename,
/// so readers never observe a half-written document.
pub fn safe_write<P: AsRef<Path>>(file_path: P, content: &[u8]) -> io::Result<()> {
    let file_path = file_path.as_ref();

    if let Some(parent) = file_path.parent() {
        ensure_directory(parent)?;
    }

    let temp_path = sibling_with_suffix(file_path, "tmp");
    if let Err(err) = fs::write(&temp_path, content) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, file_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_directory() -> io::Result<()> {
        let temp_dir = tempdir()?;
        let test_dir = temp_dir.path().join("test_subdir");

        assert!(!test_dir.exists());
        ensure_directory(&test_dir)?;
        assert!(test_dir.is_dir());

        Ok(())
    }

    #[test]
    fn test_safe_write_replaces_content() -> io::Result<()> {
        let temp_dir = tempdir()?;
        let test_file = temp_dir.path().join("nested").join("registry.json");

        safe_write(&test_file, b"first")?;
        safe_write(&test_file, b"second")?;

        assert_eq!(fs::read_to_string(&test_file)?, "second");
        assert!(!sibling_with_suffix(&test_file, "tmp").exists());

        Ok(())
    }

    #[test]
    fn test_sibling_with_suffix() {
        let path = Path::new("/models/nafnet_gopro.pth");
        assert_eq!(
            sibling_with_suffix(path, "partial"),
            PathBuf::from("/models/nafnet_gopro.pth.partial")
        );
    }

    #[test]
    fn test_remove_if_exists() -> io::Result<()> {
        let temp_dir = tempdir()?;
        let file = temp_dir.path().join("gone.bin");
        fs::write(&file, b"x")?;

        assert!(remove_if_exists(&file)?);
        assert!(!remove_if_exists(&file)?);

        Ok(())
    }
}
