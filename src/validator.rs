// Sanity checks run on a firmware image before anything is flashed.

use std::error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub const MIN_FIRMWARE_SIZE: u64 = 1024 * 1024;
pub const MAX_FIRMWARE_SIZE: u64 = 100 * 1024 * 1024;

/// Image formats the flashing tool understands.
pub const FIRMWARE_EXTENSIONS: &[&str] = &[".bin", ".img", ".trx", ".tar.gz"];

#[derive(Debug)]
pub enum ValidationError {
    Missing(PathBuf),
    NotAFile(PathBuf),
    TooSmall { size: u64 },
    TooLarge { size: u64 },
    BadExtension(String),
    Io(io::Error),
}

impl error::Error for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Missing(p) => write!(f, "Firmware file does not exist: {}", p.display()),
            Self::NotAFile(p) => write!(f, "Firmware path is not a regular file: {}", p.display()),
            Self::TooSmall { size } => write!(
                f,
                "Firmware file size {size} bytes is too small (minimum {MIN_FIRMWARE_SIZE} bytes)"
            ),
            Self::TooLarge { size } => write!(
                f,
                "Firmware file size {size} bytes is too large (maximum {MAX_FIRMWARE_SIZE} bytes)"
            ),
            Self::BadExtension(name) => write!(
                f,
                "Unsupported firmware format '{name}', expected one of {}",
                FIRMWARE_EXTENSIONS.join(", ")
            ),
            Self::Io(e) => write!(f, "Unable to inspect firmware file: {e}"),
        }
    }
}

impl From<io::Error> for ValidationError {
    fn from(e: io::Error) -> Self {
        ValidationError::Io(e)
    }
}

/// True when `name` ends in one of `extensions`, ignoring case.
pub fn has_extension(name: &str, extensions: &[&str]) -> bool {
    let lower = name.to_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext))
}

/// Checks existence, size bounds and extension of a firmware image.
pub fn validate_firmware_file(path: &Path) -> Result<(), ValidationError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ValidationError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() {
        return Err(ValidationError::NotAFile(path.to_path_buf()));
    }

    let size = meta.len();
    if size < MIN_FIRMWARE_SIZE {
        return Err(ValidationError::TooSmall { size });
    }
    if size > MAX_FIRMWARE_SIZE {
        return Err(ValidationError::TooLarge { size });
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !has_extension(&name, FIRMWARE_EXTENSIONS) {
        return Err(ValidationError::BadExtension(name));
    }

    Ok(())
}

/// Resolves the flashing tool, either an explicit path or a name looked up on PATH.
pub fn find_sysupgrade(tool: &str) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return path.is_file().then_some(path);
    }
    which::which(tool).ok()
}

pub fn is_sysupgrade_available(tool: &str) -> bool {
    find_sysupgrade(tool).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempdir::TempDir;

    fn sized_file(dir: &Path, name: &str, size: u64) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().set_len(size).unwrap();
        path
    }

    #[test]
    fn test_accepts_every_supported_format_within_bounds() {
        let tmpdir = TempDir::new("scratch").unwrap();
        for (i, ext) in FIRMWARE_EXTENSIONS.iter().enumerate() {
            for size in [MIN_FIRMWARE_SIZE, 2 * MIN_FIRMWARE_SIZE, MAX_FIRMWARE_SIZE] {
                let path = sized_file(tmpdir.path(), &format!("fw{i}-{size}{ext}"), size);
                assert!(validate_firmware_file(&path).is_ok(), "{} rejected", path.display());
            }
        }
    }

    #[test]
    fn test_size_errors_mention_size() {
        let tmpdir = TempDir::new("scratch").unwrap();

        let empty = sized_file(tmpdir.path(), "empty.bin", 0);
        let msg = validate_firmware_file(&empty).unwrap_err().to_string();
        assert!(msg.contains("size") && msg.contains("too small"), "{msg}");

        let huge = sized_file(tmpdir.path(), "huge.bin", MAX_FIRMWARE_SIZE + 1);
        let msg = validate_firmware_file(&huge).unwrap_err().to_string();
        assert!(msg.contains("size") && msg.contains("too large"), "{msg}");
    }

    #[test]
    fn test_rejects_missing_and_bad_extension() {
        let tmpdir = TempDir::new("scratch").unwrap();

        assert!(matches!(
            validate_firmware_file(&tmpdir.path().join("nope.bin")),
            Err(ValidationError::Missing(_))
        ));

        let zip = sized_file(tmpdir.path(), "fw.zip", 2 * MIN_FIRMWARE_SIZE);
        assert!(matches!(validate_firmware_file(&zip), Err(ValidationError::BadExtension(_))));

        assert!(matches!(validate_firmware_file(tmpdir.path()), Err(ValidationError::NotAFile(_))));
    }

    #[test]
    fn test_extension_match_ignores_case() {
        assert!(has_extension("FIRMWARE.BIN", FIRMWARE_EXTENSIONS));
        assert!(has_extension("openwrt-sysupgrade.tar.gz", FIRMWARE_EXTENSIONS));
        assert!(!has_extension("firmware.gz", FIRMWARE_EXTENSIONS));
    }

    #[test]
    fn test_tool_lookup() {
        assert!(is_sysupgrade_available("sh"));
        assert!(!is_sysupgrade_available("definitely-not-a-real-sysupgrade-tool"));
        assert!(!is_sysupgrade_available("/nonexistent/sysupgrade"));
    }
}
