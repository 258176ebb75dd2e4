// Ingestion of firmware images uploaded by hand.
//
// Layout on disk:
//
//   <upload_dir>/<upload_id>/<filename>
//   <upload_dir>/<upload_id>/metadata.json
//
// Only the newest few uploads are kept; older directories are removed whenever a new upload
// comes in. Failures are reported through `Option`/`bool` results and the log.

use crate::config::UploadConfig;
use crate::validator::has_extension;
use md5::Md5;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Formats accepted from a manual upload.
pub const UPLOAD_EXTENSIONS: &[&str] = &[".bin", ".img", ".trx"];

pub const METADATA_FILE: &str = "metadata.json";

/// Metadata sidecar stored next to every uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub upload_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub checksum_md5: String,
    pub checksum_sha256: String,
    /// Milliseconds since the Unix epoch.
    pub upload_timestamp: i64,
    pub verify_signature: bool,
    pub status: String,
    #[serde(default)]
    pub error_message: String,
}

pub struct UploadIngest {
    config: UploadConfig,
}

impl UploadIngest {
    pub fn new(config: UploadConfig) -> UploadIngest {
        UploadIngest { config }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.upload_dir
    }

    /// Stores an uploaded image and returns its id, or `None` if it was rejected or could not be
    /// written.
    pub fn upload_firmware_file(
        &self,
        bytes: &[u8],
        filename: &str,
        file_type: &str,
        verify_signature: bool,
    ) -> Option<String> {
        if bytes.is_empty() {
            log::warn!("Rejecting upload '{filename}': file is empty");
            return None;
        }
        if bytes.len() as u64 > self.config.max_file_size {
            log::warn!(
                "Rejecting upload '{filename}': {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.config.max_file_size
            );
            return None;
        }

        let Some(filename) = sanitize_filename(filename) else {
            log::warn!("Rejecting upload: unusable filename '{filename}'");
            return None;
        };
        if !has_extension(&filename, UPLOAD_EXTENSIONS) {
            log::warn!("Rejecting upload '{filename}': unsupported file type");
            return None;
        }

        // Make room first so the new upload brings us back to exactly `retention` entries.
        self.prune(self.config.retention.saturating_sub(1));

        let upload_id = generate_upload_id();
        let dir = self.config.upload_dir.join(&upload_id);
        match self.store(&dir, &upload_id, bytes, &filename, file_type, verify_signature) {
            Ok(info) => {
                log::info!(
                    "Stored upload {upload_id}: {} ({} bytes, sha256 {})",
                    info.filename,
                    info.file_size,
                    info.checksum_sha256
                );
                Some(upload_id)
            }
            Err(e) => {
                log::error!("Failed to store upload '{filename}': {e}");
                if let Err(e) = fs::remove_dir_all(&dir) {
                    if e.kind() != io::ErrorKind::NotFound {
                        log::warn!("Unable to remove partial upload {}: {e}", dir.display());
                    }
                }
                None
            }
        }
    }

    fn store(
        &self,
        dir: &Path,
        upload_id: &str,
        bytes: &[u8],
        filename: &str,
        file_type: &str,
        verify_signature: bool,
    ) -> io::Result<UploadInfo> {
        fs::create_dir_all(dir)?;
        let file_path = dir.join(filename);
        fs::write(&file_path, bytes)?;

        let info = UploadInfo {
            upload_id: upload_id.to_string(),
            filename: filename.to_string(),
            file_path: file_path.to_string_lossy().into_owned(),
            file_size: bytes.len() as u64,
            file_type: file_type.to_string(),
            checksum_md5: hex::encode(Md5::digest(bytes)),
            checksum_sha256: hex::encode(Sha256::digest(bytes)),
            upload_timestamp: chrono::Utc::now().timestamp_millis(),
            verify_signature,
            status: "uploaded".to_string(),
            error_message: String::new(),
        };

        let json = serde_json::to_vec_pretty(&info).map_err(io::Error::other)?;
        fs::write(dir.join(METADATA_FILE), json)?;
        Ok(info)
    }

    /// Keeps the `retention` most recent uploads and deletes the rest.
    pub fn cleanup_old_uploads(&self) {
        self.prune(self.config.retention);
    }

    fn prune(&self, keep: usize) {
        let mut entries: Vec<(i64, String, PathBuf)> = self
            .upload_dirs()
            .into_iter()
            .map(|(id, dir)| {
                // Unreadable metadata sorts as the oldest entry.
                let stamp = read_metadata(&dir).map(|i| i.upload_timestamp).unwrap_or(0);
                (stamp, id, dir)
            })
            .collect();

        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        for (_, id, dir) in entries.into_iter().skip(keep) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::info!("Removed old upload {id}"),
                Err(e) => log::warn!("Unable to remove old upload {id}: {e}"),
            }
        }
    }

    fn upload_dirs(&self) -> Vec<(String, PathBuf)> {
        let entries = match fs::read_dir(&self.config.upload_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!(
                        "Unable to read upload directory {}: {e}",
                        self.config.upload_dir.display()
                    );
                }
                return vec![];
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .collect()
    }

    /// Every upload with readable metadata, newest first.
    pub fn list_uploads(&self) -> Vec<UploadInfo> {
        let mut uploads: Vec<UploadInfo> = self
            .upload_dirs()
            .into_iter()
            .filter_map(|(_, dir)| read_metadata(&dir))
            .collect();
        uploads.sort_by(|a, b| b.upload_timestamp.cmp(&a.upload_timestamp));
        uploads
    }

    pub fn get_upload_info(&self, upload_id: &str) -> Option<UploadInfo> {
        if !is_valid_upload_id(upload_id) {
            return None;
        }
        read_metadata(&self.config.upload_dir.join(upload_id))
    }

    /// Removes an upload and its metadata. Returns false if there was nothing to remove.
    pub fn delete_upload(&self, upload_id: &str) -> bool {
        if !is_valid_upload_id(upload_id) {
            log::warn!("Refusing to delete invalid upload id '{upload_id}'");
            return false;
        }
        let dir = self.config.upload_dir.join(upload_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                log::info!("Deleted upload {upload_id}");
                true
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("Unable to delete upload {upload_id}: {e}");
                }
                false
            }
        }
    }
}

fn read_metadata(dir: &Path) -> Option<UploadInfo> {
    let path = dir.join(METADATA_FILE);
    let text = fs::read(&path).ok()?;
    match serde_json::from_slice(&text) {
        Ok(info) => Some(info),
        Err(e) => {
            log::warn!("Ignoring corrupt upload metadata {}: {e}", path.display());
            None
        }
    }
}

/// `<ms timestamp>_<random suffix>`
fn generate_upload_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}_{}", chrono::Utc::now().timestamp_millis(), suffix.to_lowercase())
}

fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Strips any directory components a client may have sent along with the name.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." || base == METADATA_FILE {
        return None;
    }
    Some(base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempdir::TempDir;

    fn ingest(dir: &Path) -> UploadIngest {
        UploadIngest::new(UploadConfig {
            upload_dir: dir.to_path_buf(),
            ..UploadConfig::default()
        })
    }

    #[test]
    fn test_upload_stores_file_and_checksums() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        let id = ingest
            .upload_firmware_file(b"hello", "router.bin", "sysupgrade", true)
            .unwrap();
        let info = ingest.get_upload_info(&id).unwrap();

        assert_eq!(info.upload_id, id);
        assert_eq!(info.filename, "router.bin");
        assert_eq!(info.file_size, 5);
        assert_eq!(info.file_type, "sysupgrade");
        assert!(info.verify_signature);
        assert_eq!(info.status, "uploaded");
        assert_eq!(info.checksum_md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(
            info.checksum_sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(fs::read(&info.file_path).unwrap(), b"hello");
    }

    #[test]
    fn test_upload_rejections() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = UploadIngest::new(UploadConfig {
            upload_dir: tmpdir.path().to_path_buf(),
            max_file_size: 16,
            retention: 3,
        });

        assert!(ingest.upload_firmware_file(b"", "fw.bin", "", false).is_none());
        assert!(ingest.upload_firmware_file(&[0; 17], "fw.bin", "", false).is_none());
        assert!(ingest.upload_firmware_file(b"abc", "fw.tar.gz", "", false).is_none());
        assert!(ingest.upload_firmware_file(b"abc", "fw.exe", "", false).is_none());
        assert!(ingest.upload_firmware_file(b"abc", "../", "", false).is_none());
        assert!(ingest.list_uploads().is_empty());
    }

    #[test]
    fn test_filename_is_reduced_to_base_name() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        let id = ingest
            .upload_firmware_file(b"abc", "../../etc/fw.img", "", false)
            .unwrap();
        let info = ingest.get_upload_info(&id).unwrap();
        assert_eq!(info.filename, "fw.img");
        assert!(Path::new(&info.file_path).starts_with(tmpdir.path()));
    }

    #[test]
    fn test_retention_keeps_three_newest() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(
                ingest
                    .upload_firmware_file(&[i as u8; 8], &format!("fw{i}.bin"), "", false)
                    .unwrap(),
            );
            std::thread::sleep(Duration::from_millis(5));
        }

        let remaining: Vec<String> = ingest.list_uploads().into_iter().map(|u| u.upload_id).collect();
        assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone(), ids[1].clone()]);
        assert_eq!(fs::read_dir(tmpdir.path()).unwrap().count(), 3);
        assert!(ingest.get_upload_info(&ids[0]).is_none());
    }

    #[test]
    fn test_corrupt_metadata_is_skipped_then_pruned() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        let corrupt = tmpdir.path().join("corrupt_entry");
        fs::create_dir_all(&corrupt).unwrap();
        fs::write(corrupt.join(METADATA_FILE), b"{ not json").unwrap();

        assert!(ingest.list_uploads().is_empty());
        assert!(ingest.get_upload_info("corrupt_entry").is_none());

        for i in 0..3 {
            ingest
                .upload_firmware_file(&[i as u8; 8], "fw.bin", "", false)
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(!corrupt.exists());
        assert_eq!(ingest.list_uploads().len(), 3);
    }

    #[test]
    fn test_cleanup_keeps_retention_count() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        for i in 0..3 {
            ingest.upload_firmware_file(&[i as u8; 8], "fw.bin", "", false).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        ingest.cleanup_old_uploads();
        assert_eq!(ingest.list_uploads().len(), 3);
    }

    #[test]
    fn test_delete_upload() {
        let tmpdir = TempDir::new("uploads").unwrap();
        let ingest = ingest(tmpdir.path());

        let id = ingest.upload_firmware_file(b"abc", "fw.trx", "", false).unwrap();
        assert!(ingest.delete_upload(&id));
        assert!(!ingest.delete_upload(&id));
        assert!(!ingest.delete_upload("../outside"));
        assert!(ingest.get_upload_info(&id).is_none());
    }

    #[test]
    fn test_upload_ids_are_unique() {
        let a = generate_upload_id();
        let b = generate_upload_id();
        assert_ne!(a, b);
        assert!(is_valid_upload_id(&a));
    }
}
