//! Reference gallery — enumeration, lazy image loading, enrollment.
//!
//! The on-disk layout pairs `<image_dir>/<base>.{jpg,jpeg,png}` with an
//! optional profile at `<data_dir>/<base>.json`. The base name is the
//! gallery identifier.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::frame::{Frame, FrameError};
use crate::profile::SubjectProfile;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const PROFILE_EXTENSION: &str = "json";
const ENROLL_JPEG_QUALITY: u8 = 90;
const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery directory unavailable: {}: {source}", path.display())]
    Unavailable { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("invalid profile {}: {source}", path.display())]
    Profile {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid base name: {0:?}")]
    InvalidName(String),
    #[error("unknown gallery entry #{0}")]
    UnknownEntry(usize),
    #[error("image: {0}")]
    Frame(#[from] FrameError),
}

/// One enumerated reference image. Bytes are fetched on demand via
/// [`GallerySource::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalleryEntry {
    /// Position in discovery order.
    pub index: usize,
    pub id: String,
    pub source: PathBuf,
}

/// A finite, ordered set of reference images.
pub trait GallerySource: Send + Sync {
    /// Enumerate entries in a stable discovery order.
    fn entries(&self) -> Result<Vec<GalleryEntry>, GalleryError>;

    /// Read the encoded image bytes for one entry.
    fn load(&self, entry: &GalleryEntry) -> Result<Vec<u8>, GalleryError>;
}

/// Directory-backed gallery with per-subject JSON profiles.
#[derive(Debug, Clone)]
pub struct DirectoryGallery {
    image_dir: PathBuf,
    data_dir: PathBuf,
}

/// A subject in the store listing. Either half may be missing.
#[derive(Debug, Clone)]
pub struct SubjectEntry {
    pub base_name: String,
    pub image: Option<PathBuf>,
    pub profile_path: Option<PathBuf>,
    pub profile: Option<SubjectProfile>,
}

impl SubjectEntry {
    fn new(base_name: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            image: None,
            profile_path: None,
            profile: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.image.is_some() && self.profile.is_some()
    }
}

impl DirectoryGallery {
    pub fn new(image_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create both directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), GalleryError> {
        for dir in [&self.image_dir, &self.data_dir] {
            std::fs::create_dir_all(dir).map_err(|source| GalleryError::Write {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn profile_path(&self, base_name: &str) -> PathBuf {
        self.data_dir.join(format!("{base_name}.{PROFILE_EXTENSION}"))
    }

    /// Load the profile for `base_name`, if one was enrolled.
    pub fn profile(&self, base_name: &str) -> Result<Option<SubjectProfile>, GalleryError> {
        validate_base_name(base_name)?;
        let path = self.profile_path(base_name);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| GalleryError::Profile { path, source }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(GalleryError::Read { path, source }),
        }
    }

    /// Write (or overwrite) the profile for `base_name`.
    pub fn save_profile(&self, base_name: &str, profile: &SubjectProfile) -> Result<PathBuf, GalleryError> {
        validate_base_name(base_name)?;
        let path = self.profile_path(base_name);
        let json = serde_json::to_string_pretty(profile).map_err(|source| GalleryError::Profile {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| GalleryError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Enroll a subject: store the image as `<base>.jpg` and its profile.
    ///
    /// `createdAt` is stamped when absent and `fileName` is always set to
    /// the base name.
    pub fn enroll(
        &self,
        base_name: &str,
        frame: &Frame,
        mut profile: SubjectProfile,
    ) -> Result<PathBuf, GalleryError> {
        validate_base_name(base_name)?;
        self.ensure_dirs()?;

        let image_path = self.image_dir.join(format!("{base_name}.jpg"));
        let jpeg = frame.encode_jpeg(ENROLL_JPEG_QUALITY)?;
        std::fs::write(&image_path, jpeg).map_err(|source| GalleryError::Write {
            path: image_path.clone(),
            source,
        })?;
        // Re-enrolling over `<base>.png` must not leave two entries with one id.
        for stale in self.images_for(base_name)?.into_iter().filter(|p| *p != image_path) {
            std::fs::remove_file(&stale).map_err(|source| GalleryError::Write {
                path: stale.clone(),
                source,
            })?;
            tracing::debug!(path = %stale.display(), "replaced stale gallery image");
        }

        if profile.created_at.is_none() {
            profile.created_at = Some(chrono::Local::now().format(CREATED_AT_FORMAT).to_string());
        }
        profile.file_name = Some(base_name.to_string());
        let profile_path = self.save_profile(base_name, &profile)?;

        tracing::info!(
            base_name,
            image = %image_path.display(),
            profile = %profile_path.display(),
            "subject enrolled"
        );
        Ok(image_path)
    }

    /// Delete the image(s) and profile for `base_name`. Returns whether
    /// anything was removed.
    pub fn remove(&self, base_name: &str) -> Result<bool, GalleryError> {
        validate_base_name(base_name)?;
        let mut removed = false;
        let candidates = self
            .images_for(base_name)?
            .into_iter()
            .chain(std::iter::once(self.profile_path(base_name)));
        for path in candidates {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed gallery file");
                    removed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(GalleryError::Write { path, source }),
            }
        }
        Ok(removed)
    }

    /// Image files whose stem is exactly `base_name`, any supported extension.
    fn images_for(&self, base_name: &str) -> Result<Vec<PathBuf>, GalleryError> {
        Ok(list_files(&self.image_dir, &IMAGE_EXTENSIONS)?
            .into_iter()
            .filter(|path| file_stem(path).as_deref() == Some(base_name))
            .collect())
    }

    /// List every subject that has an image, a profile, or both, sorted by
    /// base name. Unreadable profiles are logged and listed without data.
    pub fn subjects(&self) -> Result<Vec<SubjectEntry>, GalleryError> {
        let mut by_name: BTreeMap<String, SubjectEntry> = BTreeMap::new();

        for entry in self.entries()? {
            by_name
                .entry(entry.id.clone())
                .or_insert_with(|| SubjectEntry::new(&entry.id))
                .image
                .get_or_insert(entry.source);
        }

        for path in list_files(&self.data_dir, &[PROFILE_EXTENSION])? {
            let Some(base) = file_stem(&path) else {
                continue;
            };
            let subject = by_name
                .entry(base.clone())
                .or_insert_with(|| SubjectEntry::new(&base));
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<SubjectProfile>(&raw).map_err(|e| e.to_string()))
            {
                Ok(profile) => subject.profile = Some(profile),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "unreadable subject profile");
                }
            }
            subject.profile_path = Some(path);
        }

        Ok(by_name.into_values().collect())
    }
}

impl GallerySource for DirectoryGallery {
    fn entries(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        let entries = list_files(&self.image_dir, &IMAGE_EXTENSIONS)?
            .into_iter()
            .filter_map(|path| file_stem(&path).map(|id| (id, path)))
            .enumerate()
            .map(|(index, (id, source))| GalleryEntry { index, id, source })
            .collect();
        Ok(entries)
    }

    fn load(&self, entry: &GalleryEntry) -> Result<Vec<u8>, GalleryError> {
        std::fs::read(&entry.source).map_err(|source| GalleryError::Read {
            path: entry.source.clone(),
            source,
        })
    }
}

/// In-memory gallery of encoded images, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryGallery {
    images: Vec<(String, Vec<u8>)>,
}

impl MemoryGallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: impl Into<String>, bytes: Vec<u8>) {
        self.images.push((id.into(), bytes));
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl GallerySource for MemoryGallery {
    fn entries(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        Ok(self
            .images
            .iter()
            .enumerate()
            .map(|(index, (id, _))| GalleryEntry {
                index,
                id: id.clone(),
                source: PathBuf::from(id),
            })
            .collect())
    }

    fn load(&self, entry: &GalleryEntry) -> Result<Vec<u8>, GalleryError> {
        self.images
            .get(entry.index)
            .map(|(_, bytes)| bytes.clone())
            .ok_or(GalleryError::UnknownEntry(entry.index))
    }
}

fn validate_base_name(base_name: &str) -> Result<(), GalleryError> {
    let invalid = base_name.trim().is_empty()
        || base_name == "."
        || base_name == ".."
        || base_name.contains(['/', '\\']);
    if invalid {
        return Err(GalleryError::InvalidName(base_name.to_string()));
    }
    Ok(())
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Regular files in `dir` whose extension matches (case-insensitive),
/// sorted by file name. A missing directory yields an empty list.
fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, GalleryError> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(GalleryError::Unavailable {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut files: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gallery() -> (tempfile::TempDir, DirectoryGallery) {
        let dir = tempfile::tempdir().unwrap();
        let gallery = DirectoryGallery::new(dir.path().join("images"), dir.path().join("data"));
        (dir, gallery)
    }

    #[test]
    fn test_missing_dirs_are_empty() {
        let (_dir, gallery) = gallery();
        assert!(gallery.entries().unwrap().is_empty());
        assert!(gallery.subjects().unwrap().is_empty());
        assert!(gallery.profile("nobody").unwrap().is_none());
    }

    #[test]
    fn test_entries_sorted_and_filtered() {
        let (_dir, gallery) = gallery();
        gallery.ensure_dirs().unwrap();
        for name in ["b.PNG", "a.jpg", "c.jpeg", "notes.txt"] {
            std::fs::write(gallery.image_dir().join(name), b"x").unwrap();
        }
        let entries = gallery.entries().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let indices: Vec<usize> = entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(gallery.load(&entries[0]).unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_enroll_writes_image_and_profile() {
        let (_dir, gallery) = gallery();
        let frame = Frame::solid(8, 8, [10, 200, 30]);
        let mut profile = SubjectProfile::named("Ada");
        profile.department = Some("Math".into());

        let path = gallery.enroll("ada", &frame, profile).unwrap();
        assert_eq!(path, gallery.image_dir().join("ada.jpg"));
        assert!(Frame::open(&path).is_ok());

        let stored = gallery.profile("ada").unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Ada"));
        assert_eq!(stored.department.as_deref(), Some("Math"));
        assert_eq!(stored.file_name.as_deref(), Some("ada"));
        assert!(stored.created_at.is_some());

        let subjects = gallery.subjects().unwrap();
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].is_complete());
    }

    #[test]
    fn test_reenroll_replaces_other_extension() {
        let (_dir, gallery) = gallery();
        gallery.ensure_dirs().unwrap();
        std::fs::write(gallery.image_dir().join("ada.png"), b"old").unwrap();
        std::fs::write(gallery.image_dir().join("ada.JPEG"), b"older").unwrap();
        std::fs::write(gallery.image_dir().join("ada_2.png"), b"other").unwrap();

        gallery
            .enroll("ada", &Frame::solid(4, 4, [1, 2, 3]), SubjectProfile::named("Ada"))
            .unwrap();
        gallery
            .enroll("ada", &Frame::solid(4, 4, [3, 2, 1]), SubjectProfile::named("Ada"))
            .unwrap();

        let entries = gallery.entries().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["ada", "ada_2"]);
        assert_eq!(entries[0].source, gallery.image_dir().join("ada.jpg"));
    }

    #[test]
    fn test_subjects_pairs_by_base_name() {
        let (_dir, gallery) = gallery();
        gallery.ensure_dirs().unwrap();
        std::fs::write(gallery.image_dir().join("only_image.png"), b"x").unwrap();
        gallery.save_profile("only_data", &SubjectProfile::named("D")).unwrap();
        std::fs::write(gallery.data_dir().join("broken.json"), b"{not json").unwrap();

        let subjects = gallery.subjects().unwrap();
        let names: Vec<&str> = subjects.iter().map(|s| s.base_name.as_str()).collect();
        assert_eq!(names, vec!["broken", "only_data", "only_image"]);
        assert!(subjects[0].profile.is_none() && subjects[0].profile_path.is_some());
        assert!(subjects[1].image.is_none() && subjects[1].profile.is_some());
        assert!(subjects[2].image.is_some() && subjects[2].profile.is_none());
    }

    #[test]
    fn test_remove() {
        let (_dir, gallery) = gallery();
        gallery
            .enroll("gone", &Frame::solid(4, 4, [0, 0, 0]), SubjectProfile::default())
            .unwrap();
        std::fs::write(gallery.image_dir().join("gone.PNG"), b"x").unwrap();
        assert!(gallery.remove("gone").unwrap());
        assert!(!gallery.remove("gone").unwrap());
        assert!(gallery.entries().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_base_names() {
        let (_dir, gallery) = gallery();
        for bad in ["", "  ", "..", "a/b", "a\\b"] {
            assert!(matches!(gallery.profile(bad), Err(GalleryError::InvalidName(_))));
        }
    }

    #[test]
    fn test_memory_gallery() {
        let mut gallery = MemoryGallery::new();
        gallery.push("one", vec![1]);
        gallery.push("two", vec![2]);
        let entries = gallery.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(gallery.load(&entries[1]).unwrap(), vec![2]);
        let bogus = GalleryEntry {
            index: 9,
            id: "x".into(),
            source: PathBuf::from("x"),
        };
        assert!(matches!(gallery.load(&bogus), Err(GalleryError::UnknownEntry(9))));
    }
}
