//! On-disk community background cache
//!
//! Directory structure:
//! <root>/
//!   backgrounds.conf                      - newline-delimited index of image ids
//!   backgrounds/<image_id>/metadata.json  - metadata document as downloaded
//!   backgrounds/<image_id>/<image_id>.jpeg
//!
//! Only the rotation engine writes here; observers read.

use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

use crate::catalog::ImageMetadata;
use crate::error::CacheError;

/// Index filename
const INDEX_FILE: &str = "backgrounds.conf";

/// Image directory name
const IMAGES_DIR: &str = "backgrounds";

const METADATA_FILE: &str = "metadata.json";

/// Cached images are always stored with this extension
const IMAGE_EXTENSION: &str = "jpeg";

/// Cache key: an image filename with everything from the first `.` removed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Validate a raw id read from the index or a request
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && !raw.contains(['/', '\\', '\0']);

        if valid {
            Ok(ImageId(raw.to_string()))
        } else {
            Err(CacheError::InvalidImageId(raw.to_string()))
        }
    }

    /// Derive the id from a catalog filename (`sunrise.jpg` -> `sunrise`)
    pub fn from_filename(filename: &str) -> Result<Self, CacheError> {
        let stem = filename.split('.').next().unwrap_or_default();
        Self::parse(stem)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ImageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Background cache rooted at a per-user directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    fn image_dir(&self, id: &ImageId) -> PathBuf {
        self.images_dir().join(id.as_str())
    }

    pub fn metadata_path(&self, id: &ImageId) -> PathBuf {
        self.image_dir(id).join(METADATA_FILE)
    }

    pub fn image_path(&self, id: &ImageId) -> PathBuf {
        self.image_dir(id)
            .join(format!("{}.{}", id.as_str(), IMAGE_EXTENSION))
    }

    /// Create the directory tree if it does not exist yet
    pub fn ensure_dirs(&self) -> Result<(), CacheError> {
        let dir = self.images_dir();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(dir, e))
    }

    pub fn index_exists(&self) -> bool {
        self.index_path().is_file()
    }

    /// Read the index, skipping blank, invalid and duplicate lines
    pub fn read_index(&self) -> Result<Vec<ImageId>, CacheError> {
        let path = self.index_path();
        let contents = fs::read_to_string(&path).map_err(|e| CacheError::io(&path, e))?;

        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match ImageId::parse(line) {
                Ok(id) => {
                    if seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
                Err(e) => tracing::warn!("Skipping index entry: {}", e),
            }
        }

        Ok(ids)
    }

    pub fn append_to_index(&self, id: &ImageId) -> Result<(), CacheError> {
        let path = self.index_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CacheError::io(&path, e))?;

        writeln!(file, "{}", id).map_err(|e| CacheError::io(&path, e))
    }

    /// Remove the index and every cached image, leaving an empty tree
    pub fn clear_all(&self) -> Result<(), CacheError> {
        let index = self.index_path();
        match fs::remove_file(&index) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(index, e)),
        }

        let dir = self.images_dir();
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(dir, e)),
        }

        self.ensure_dirs()
    }

    pub fn has_image_metadata(&self, id: &ImageId) -> bool {
        self.metadata_path(id).is_file()
    }

    pub fn has_image_file(&self, id: &ImageId) -> bool {
        self.image_path(id).is_file()
    }

    /// Store the metadata document verbatim
    pub fn write_metadata(&self, id: &ImageId, data: &[u8]) -> Result<(), CacheError> {
        let dir = self.image_dir(id);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let path = self.metadata_path(id);
        fs::write(&path, data).map_err(|e| CacheError::io(path, e))
    }

    /// Store image bytes; the file only appears once fully written
    pub fn write_image_file(&self, id: &ImageId, data: &[u8]) -> Result<(), CacheError> {
        let dir = self.image_dir(id);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let path = self.image_path(id);
        let partial = path.with_extension(format!("{}.part", IMAGE_EXTENSION));
        fs::write(&partial, data).map_err(|e| CacheError::io(&partial, e))?;
        fs::rename(&partial, &path).map_err(|e| CacheError::io(path, e))
    }

    pub fn read_metadata(&self, id: &ImageId) -> Result<ImageMetadata, CacheError> {
        let path = self.metadata_path(id);
        let data = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;

        ImageMetadata::from_slice(&data).map_err(|e| CacheError::Metadata {
            image_id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// True when any indexed image can be shown without a download
    pub fn has_displayable_image(&self) -> bool {
        self.read_index()
            .map(|ids| ids.iter().any(|id| self.has_image_file(id)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        store.ensure_dirs().unwrap();
        (dir, store)
    }

    fn id(raw: &str) -> ImageId {
        ImageId::parse(raw).unwrap()
    }

    #[test]
    fn test_image_id_from_filename() {
        assert_eq!(ImageId::from_filename("sunrise.jpg").unwrap(), id("sunrise"));
        assert_eq!(ImageId::from_filename("lake.tar.gz").unwrap(), id("lake"));
        assert_eq!(ImageId::from_filename("plain").unwrap(), id("plain"));
        assert!(ImageId::from_filename(".hidden").is_err());
        assert!(ImageId::from_filename("").is_err());
    }

    #[test]
    fn test_image_id_rejects_paths() {
        assert!(ImageId::parse("../etc").is_err());
        assert!(ImageId::parse("a/b").is_err());
        assert!(ImageId::parse("..").is_err());
        assert!(ImageId::parse("  ").is_err());
    }

    #[test]
    fn test_layout() {
        let (_dir, store) = store();
        let forest = id("forest");
        assert!(store
            .image_path(&forest)
            .ends_with("backgrounds/forest/forest.jpeg"));
        assert!(store
            .metadata_path(&forest)
            .ends_with("backgrounds/forest/metadata.json"));
    }

    #[test]
    fn test_index_append_and_read() {
        let (_dir, store) = store();
        assert!(!store.index_exists());

        store.append_to_index(&id("a")).unwrap();
        store.append_to_index(&id("b")).unwrap();
        store.append_to_index(&id("a")).unwrap();

        assert!(store.index_exists());
        assert_eq!(store.read_index().unwrap(), vec![id("a"), id("b")]);
    }

    #[test]
    fn test_index_skips_garbage_lines() {
        let (_dir, store) = store();
        fs::write(store.root().join(INDEX_FILE), "a\n\n../x\nb\n").unwrap();
        assert_eq!(store.read_index().unwrap(), vec![id("a"), id("b")]);
    }

    #[test]
    fn test_metadata_and_image_presence() {
        let (_dir, store) = store();
        let lake = id("lake");
        assert!(!store.has_image_metadata(&lake));
        assert!(!store.has_image_file(&lake));

        store
            .write_metadata(&lake, br#"{"filename":"lake.jpg","author":"Sam","camera":"X100"}"#)
            .unwrap();
        assert!(store.has_image_metadata(&lake));
        assert!(!store.has_image_file(&lake));

        let metadata = store.read_metadata(&lake).unwrap();
        assert_eq!(metadata.filename, "lake.jpg");
        assert_eq!(metadata.author.as_deref(), Some("Sam"));
        assert_eq!(metadata.extra.get("camera").and_then(|v| v.as_str()), Some("X100"));

        store.write_image_file(&lake, b"\xFF\xD8\xFFdata").unwrap();
        assert!(store.has_image_file(&lake));
        assert_eq!(fs::read(store.image_path(&lake)).unwrap(), b"\xFF\xD8\xFFdata");
    }

    #[test]
    fn test_malformed_metadata_is_an_error() {
        let (_dir, store) = store();
        let broken = id("broken");
        store.write_metadata(&broken, b"not json").unwrap();
        assert!(matches!(
            store.read_metadata(&broken),
            Err(CacheError::Metadata { .. })
        ));
    }

    #[test]
    fn test_clear_all() {
        let (_dir, store) = store();
        let lake = id("lake");
        store.write_metadata(&lake, br#"{"filename":"lake.jpg"}"#).unwrap();
        store.write_image_file(&lake, b"img").unwrap();
        store.append_to_index(&lake).unwrap();

        store.clear_all().unwrap();

        assert!(!store.index_exists());
        assert!(!store.has_image_metadata(&lake));
        assert!(store.root().join(IMAGES_DIR).is_dir());
    }

    #[test]
    fn test_has_displayable_image() {
        let (_dir, store) = store();
        assert!(!store.has_displayable_image());

        let lake = id("lake");
        store.append_to_index(&lake).unwrap();
        assert!(!store.has_displayable_image());

        store.write_image_file(&lake, b"img").unwrap();
        assert!(store.has_displayable_image());
    }
}
