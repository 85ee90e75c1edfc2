//! Shared file catalogs.
//!
//! The local [`Catalog`] is the set of files this node serves. Remote
//! catalogs arrive as kind 10020 announcements and are kept per advertiser
//! in [`RemoteCatalogs`], newest announcement wins.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use walkdir::WalkDir;

use crate::core::error::CatalogError;
use crate::core::identity::PeerIdentity;

/// MIME type used when the file extension is not recognized.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Catalog shared between the node loop and the engines' serve tasks.
pub type SharedCatalog = Arc<RwLock<Catalog>>;

/// Where the bytes of a shared file come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentHandle {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file this node is willing to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub content: ContentHandle,
}

impl FileDescriptor {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        Self {
            mime_type: mime_from_name(&name).to_string(),
            size: data.len() as u64,
            name,
            content: ContentHandle::Memory(data),
        }
    }

    /// Describe a file on disk under the given advertised name.
    pub fn from_path(path: &Path, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("Not a regular file: {}", path.display());
        }
        Ok(Self {
            mime_type: mime_from_name(&name).to_string(),
            size: metadata.len(),
            name,
            content: ContentHandle::Path(path.to_path_buf()),
        })
    }

    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            size: Some(self.size),
            mime: Some(self.mime_type.clone()),
        }
    }

    /// Wire form used in catalog announcements.
    pub fn to_entry(&self) -> CatalogEntry {
        CatalogEntry {
            name: self.name.clone(),
            metadata: serde_json::to_string(&self.metadata()).unwrap_or_default(),
        }
    }
}

/// Metadata JSON carried in the third element of a `file` tag.
///
/// Every field is optional: other clients add their own keys or leave
/// these out, and a catalog entry must never be rejected over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// One advertised file as it travels over the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    /// Raw metadata JSON. Kept verbatim so unknown keys survive.
    pub metadata: String,
}

impl CatalogEntry {
    pub fn parsed_metadata(&self) -> FileMetadata {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    pub fn size(&self) -> Option<u64> {
        self.parsed_metadata().size
    }

    pub fn mime_type(&self) -> Option<String> {
        self.parsed_metadata().mime
    }
}

/// The set of files served by this node. Names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    files: Vec<FileDescriptor>,
}

impl Catalog {
    pub fn new(files: Vec<FileDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::new();
        for file in &files {
            if !seen.insert(file.name.as_str()) {
                return Err(CatalogError::DuplicateName(file.name.clone()));
            }
        }
        Ok(Self { files })
    }

    /// Build a catalog from files and folders on disk.
    ///
    /// A file is advertised under its file name. A folder is walked
    /// recursively and each file in it is advertised under its path relative
    /// to the folder's parent (`photos/2024/a.jpg`), sorted by that path.
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::new();

        for path in paths {
            if path.is_dir() {
                files.extend(walk_folder(path)?);
            } else {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("Invalid file name: {}", path.display()))?;
                files.push(FileDescriptor::from_path(path, name)?);
            }
        }

        Ok(Self::new(files)?)
    }

    pub fn get(&self, name: &str) -> Option<&FileDescriptor> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.files.iter().map(FileDescriptor::to_entry).collect()
    }

    pub fn into_shared(self) -> SharedCatalog {
        Arc::new(RwLock::new(self))
    }
}

fn walk_folder(folder_path: &Path) -> Result<Vec<FileDescriptor>> {
    let folder_name = folder_path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Invalid folder name")?;

    let mut files = Vec::new();
    for entry in WalkDir::new(folder_path).sort_by_file_name() {
        let entry = entry.context("Failed to read directory entry")?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel_path = entry
            .path()
            .strip_prefix(folder_path)
            .context("Failed to calculate relative path")?;

        let mut name = folder_name.to_string();
        for component in rel_path.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        files.push(FileDescriptor::from_path(entry.path(), name)?);
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Guess a MIME type from the extension of a file name.
pub fn mime_from_name(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => return DEFAULT_MIME_TYPE,
    };
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// One catalog announcement, as decoded from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogAnnouncement {
    pub advertiser: PeerIdentity,
    /// Relay event id, hex. Breaks ties between announcements made in the
    /// same second.
    pub event_id: String,
    /// Relay timestamp of the announcement, in seconds.
    pub created_at: u64,
    pub entries: Vec<CatalogEntry>,
}

impl CatalogAnnouncement {
    /// Replaceable-event order: later `created_at` wins; within the same
    /// second the lower event id wins.
    fn supersedes(&self, other: &CatalogAnnouncement) -> bool {
        match self.created_at.cmp(&other.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.event_id < other.event_id,
        }
    }
}

/// Latest known catalog of every advertiser seen on the relay.
#[derive(Debug, Default)]
pub struct RemoteCatalogs {
    by_advertiser: HashMap<PeerIdentity, CatalogAnnouncement>,
}

impl RemoteCatalogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an announcement, replacing the advertiser's previous catalog
    /// wholesale if it supersedes it. Redelivered and older announcements
    /// are ignored, so the result does not depend on arrival order.
    /// Returns whether the stored catalog changed.
    pub fn apply(&mut self, announcement: CatalogAnnouncement) -> bool {
        if let Some(current) = self.by_advertiser.get(&announcement.advertiser) {
            if !announcement.supersedes(current) {
                if announcement.event_id != current.event_id {
                    log::debug!(
                        "Ignoring superseded catalog {} from {} (created {}, have {})",
                        announcement.event_id,
                        announcement.advertiser.short(),
                        announcement.created_at,
                        current.created_at
                    );
                }
                return false;
            }
        }
        self.by_advertiser
            .insert(announcement.advertiser, announcement);
        true
    }

    pub fn get(&self, advertiser: &PeerIdentity) -> Option<&CatalogAnnouncement> {
        self.by_advertiser.get(advertiser)
    }

    /// All catalogs, ordered by advertiser.
    pub fn snapshot(&self) -> Vec<CatalogAnnouncement> {
        let mut all: Vec<_> = self.by_advertiser.values().cloned().collect();
        all.sort_by(|a, b| a.advertiser.cmp(&b.advertiser));
        all
    }

    pub fn len(&self) -> usize {
        self.by_advertiser.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_advertiser.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entry(name: &str) -> CatalogEntry {
        CatalogEntry {
            name: name.to_string(),
            metadata: "{}".to_string(),
        }
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = Catalog::new(vec![
            FileDescriptor::from_bytes("a.txt", "one"),
            FileDescriptor::from_bytes("a.txt", "two"),
        ]);
        assert_eq!(result, Err(CatalogError::DuplicateName("a.txt".to_string())));
    }

    #[test]
    fn test_get_by_name() {
        let catalog = Catalog::new(vec![
            FileDescriptor::from_bytes("a.txt", "hello"),
            FileDescriptor::from_bytes("b.png", vec![0u8; 3]),
        ])
        .unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("b.png").unwrap().mime_type, "image/png");
        assert_eq!(catalog.get("a.txt").unwrap().size, 5);
        assert!(catalog.get("c.txt").is_none());
    }

    #[test]
    fn test_mime_from_name() {
        assert_eq!(mime_from_name("photo.JPG"), "image/jpeg");
        assert_eq!(mime_from_name("notes.txt"), "text/plain");
        assert_eq!(mime_from_name("archive.tar.gz"), "application/gzip");
        assert_eq!(mime_from_name("Makefile"), DEFAULT_MIME_TYPE);
        assert_eq!(mime_from_name("data.unknownext"), DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_entry_metadata_json() {
        let file = FileDescriptor::from_bytes("a.txt", "hello world");
        let entry = file.to_entry();
        assert_eq!(entry.name, "a.txt");
        assert_eq!(entry.size(), Some(11));
        assert_eq!(entry.mime_type().as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_metadata_parsing_is_lenient() {
        // Browser clients include an extra "file" object
        let browser = CatalogEntry {
            name: "a.txt".to_string(),
            metadata: r#"{"size":5,"mime":"text/plain","file":{}}"#.to_string(),
        };
        assert_eq!(browser.size(), Some(5));

        let empty = CatalogEntry {
            name: "b".to_string(),
            metadata: String::new(),
        };
        assert_eq!(empty.parsed_metadata(), FileMetadata::default());

        let garbage = CatalogEntry {
            name: "c".to_string(),
            metadata: "not json".to_string(),
        };
        assert_eq!(garbage.size(), None);
    }

    #[test]
    fn test_from_paths_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        fs::write(&path, b"%PDF").unwrap();

        let catalog = Catalog::from_paths(&[path.clone()]).unwrap();
        let file = catalog.get("report.pdf").unwrap();
        assert_eq!(file.size, 4);
        assert_eq!(file.mime_type, "application/pdf");
        assert_eq!(file.content, ContentHandle::Path(path));
    }

    #[test]
    fn test_from_paths_walks_folder_sorted() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("photos");
        fs::create_dir_all(root.join("2024")).unwrap();
        fs::write(root.join("b.jpg"), b"b").unwrap();
        fs::write(root.join("a.jpg"), b"a").unwrap();
        fs::write(root.join("2024").join("c.jpg"), b"c").unwrap();

        let catalog = Catalog::from_paths(&[root]).unwrap();
        let names: Vec<&str> = catalog.files().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["photos/2024/c.jpg", "photos/a.jpg", "photos/b.jpg"]);
    }

    #[test]
    fn test_from_paths_rejects_colliding_names() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("one");
        let second = dir.path().join("two");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("same.txt"), b"1").unwrap();
        fs::write(second.join("same.txt"), b"2").unwrap();

        let result = Catalog::from_paths(&[first.join("same.txt"), second.join("same.txt")]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_paths_missing_file() {
        let dir = tempdir().unwrap();
        assert!(Catalog::from_paths(&[dir.path().join("nope.txt")]).is_err());
    }

    #[test]
    fn test_remote_catalog_replaced_wholesale() {
        let peer = PeerIdentity::from_bytes([1; 32]);
        let mut catalogs = RemoteCatalogs::new();

        assert!(catalogs.apply(CatalogAnnouncement {
            advertiser: peer,
            event_id: "e1".to_string(),
            created_at: 10,
            entries: vec![entry("x"), entry("y")],
        }));
        assert!(catalogs.apply(CatalogAnnouncement {
            advertiser: peer,
            event_id: "e2".to_string(),
            created_at: 11,
            entries: vec![entry("z")],
        }));

        let stored = catalogs.get(&peer).unwrap();
        assert_eq!(stored.entries, vec![entry("z")]);
    }

    #[test]
    fn test_remote_catalog_ignores_stale() {
        let peer = PeerIdentity::from_bytes([1; 32]);
        let mut catalogs = RemoteCatalogs::new();

        catalogs.apply(CatalogAnnouncement {
            advertiser: peer,
            event_id: "e3".to_string(),
            created_at: 20,
            entries: vec![entry("new")],
        });
        assert!(!catalogs.apply(CatalogAnnouncement {
            advertiser: peer,
            event_id: "e4".to_string(),
            created_at: 19,
            entries: vec![entry("old")],
        }));
        assert_eq!(catalogs.get(&peer).unwrap().entries, vec![entry("new")]);
    }

    #[test]
    fn test_remote_catalogs_per_advertiser() {
        let a = PeerIdentity::from_bytes([1; 32]);
        let b = PeerIdentity::from_bytes([2; 32]);
        let mut catalogs = RemoteCatalogs::new();

        catalogs.apply(CatalogAnnouncement {
            advertiser: b,
            event_id: "e5".to_string(),
            created_at: 1,
            entries: vec![entry("b")],
        });
        catalogs.apply(CatalogAnnouncement {
            advertiser: a,
            event_id: "e6".to_string(),
            created_at: 1,
            entries: vec![],
        });

        let snapshot = catalogs.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].advertiser, a);
        assert!(snapshot[0].entries.is_empty());
        assert_eq!(snapshot[1].entries, vec![entry("b")]);
    }

    #[test]
    fn test_identical_announcement_is_not_a_change() {
        let peer = PeerIdentity::from_bytes([3; 32]);
        let announcement = CatalogAnnouncement {
            advertiser: peer,
            event_id: "e7".to_string(),
            created_at: 5,
            entries: vec![entry("x")],
        };
        let mut catalogs = RemoteCatalogs::new();
        assert!(catalogs.apply(announcement.clone()));
        assert!(!catalogs.apply(announcement));
    }

    #[test]
    fn test_same_second_catalogs_settle_regardless_of_order() {
        let peer = PeerIdentity::from_bytes([4; 32]);
        let first = CatalogAnnouncement {
            advertiser: peer,
            event_id: "b7".to_string(),
            created_at: 100,
            entries: vec![entry("old")],
        };
        let second = CatalogAnnouncement {
            advertiser: peer,
            event_id: "3c".to_string(),
            created_at: 100,
            entries: vec![entry("new")],
        };

        let mut in_order = RemoteCatalogs::new();
        for announcement in [&first, &second] {
            in_order.apply(announcement.clone());
        }

        // Copies arriving from several relays, interleaved
        let mut shuffled = RemoteCatalogs::new();
        for announcement in [&second, &first, &second, &first] {
            shuffled.apply(announcement.clone());
        }

        assert_eq!(in_order.get(&peer), shuffled.get(&peer));
        assert_eq!(shuffled.get(&peer).unwrap().event_id, "3c");
        assert!(!shuffled.apply(first.clone()));
    }
}
