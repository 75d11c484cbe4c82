use std::path::{Path, PathBuf};

pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }
}

/// Replaces the content of `path` so that readers see either the old or the new content.
///
/// The data is written into a temporary file in the same directory, which is then renamed over
/// the target.
pub fn write_atomically(path: &Path, data: &[u8]) -> crate::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)?;

    let tmp_file = tempfile::NamedTempFile::new_in(directory)?;
    std::fs::write(tmp_file.path(), data)?;
    tmp_file
        .persist(path)
        .map_err(|error| crate::Error::IoError(error.error))?;
    Ok(())
}
