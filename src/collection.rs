use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, trace, warn};

// A file only gets this much of a look before we decide what it is.
const SNIFF_LENGTH: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaClass {
    Item,
    ImageItem,
    AudioItem,
    VideoItem,
}

impl MediaClass {
    pub const fn upnp_class(self) -> &'static str {
        match self {
            Self::Item => "object.item",
            Self::ImageItem => "object.item.imageItem",
            Self::AudioItem => "object.item.audioItem",
            Self::VideoItem => "object.item.videoItem",
        }
    }

    /// Pick the item class from the MIME type's top-level category. Ogg is
    /// the odd one out: it travels as application/ogg but renders as audio.
    fn from_mime(mime: &str) -> Self {
        if mime == "application/ogg" {
            return Self::AudioItem;
        }
        match mime.split('/').next() {
            Some("image") => Self::ImageItem,
            Some("audio") => Self::AudioItem,
            Some("video") => Self::VideoItem,
            _ => Self::Item,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub id: usize,
    pub parent_id: usize,
    pub title: String,
    pub storage_used: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub id: usize,
    pub parent_id: usize,
    pub title: String,
    pub class: MediaClass,
    pub mime: String,
    pub path: PathBuf,
}

impl Item {
    pub fn protocol_info(&self) -> String {
        format!("http-get:*:{}:*", self.mime)
    }
}

/// Containers and items are a tagged-variant set, not a hierarchy; Browse
/// just filters the flat sequence by parent ID.
#[derive(Clone, Debug)]
pub enum Entry {
    Container(Container),
    Item(Item),
}

impl Entry {
    pub const fn id(&self) -> usize {
        match self {
            Self::Container(c) => c.id,
            Self::Item(i) => i.id,
        }
    }

    pub const fn parent_id(&self) -> usize {
        match self {
            Self::Container(c) => c.parent_id,
            Self::Item(i) => i.parent_id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Container(c) => &c.title,
            Self::Item(i) => &i.title,
        }
    }
}

/// A snapshot of the shared directory, indexed once at startup and
/// read-only afterwards. IDs are assigned in walk order starting at 0 for
/// the root, so an entry's ID doubles as its index.
#[derive(Clone, Debug)]
pub struct Collection {
    base: PathBuf,
    entries: Vec<Entry>,
}

impl Collection {
    pub fn index(location: &Path) -> io::Result<Self> {
        info!("indexing collection from {}", location.display());
        let start = Instant::now();

        let mut entries = Vec::new();
        let mut container_ids: HashMap<PathBuf, usize> = HashMap::new();
        walk(location, &mut entries, &mut container_ids)?;

        info!("indexed {} entries in {:.2?}", entries.len(), start.elapsed());

        Ok(Self {
            base: location.to_path_buf(),
            entries,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn get(&self, id: usize) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Direct children in walk order. The root is its own parent in the
    /// table, so it is filtered out of its own listing.
    pub fn children(&self, parent_id: usize) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |e| e.parent_id() == parent_id && e.id() != parent_id)
    }

    pub fn child_count(&self, parent_id: usize) -> usize {
        self.children(parent_id).count()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Pre-order walk, lexicographic within each directory so IDs come out the
/// same on every run over the same tree. Symlinks are followed, which is
/// how a multi-directory invocation gets merged into one root.
fn walk(
    dir: &Path,
    entries: &mut Vec<Entry>,
    container_ids: &mut HashMap<PathBuf, usize>,
) -> io::Result<()> {
    let id = entries.len();
    let parent_id = dir
        .parent()
        .and_then(|p| container_ids.get(p))
        .copied()
        .unwrap_or(0);

    let metadata = fs::metadata(dir)?;
    let title = dir
        .file_name()
        .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());
    entries.push(Entry::Container(Container {
        id,
        parent_id,
        title,
        storage_used: metadata.len(),
    }));
    container_ids.insert(dir.to_path_buf(), id);

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        // follows symlinks, unlike DirEntry::file_type
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!("skipping {}: {err}", path.display());
                continue;
            }
        };
        if metadata.is_dir() {
            walk(&path, entries, container_ids)?;
        } else if metadata.is_file() {
            let id = entries.len();
            let title = path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
            let (mime, class) = sniff_mime(&path);
            trace!("{} -> {mime}", path.display());
            entries.push(Entry::Item(Item {
                id,
                parent_id: container_ids[dir],
                title,
                class,
                mime,
                path,
            }));
        }
    }

    Ok(())
}

/// Decide a file's MIME type from a bounded prefix, falling back to its
/// extension. Files nothing recognizes keep the wildcard type and the
/// generic item class.
fn sniff_mime(path: &Path) -> (String, MediaClass) {
    let mut prefix = Vec::with_capacity(SNIFF_LENGTH as usize);
    if let Ok(file) = File::open(path) {
        // short reads are fine, magic numbers sit at the front
        let _ = file.take(SNIFF_LENGTH).read_to_end(&mut prefix);
    }

    if let Some(mime) = sniff_magic(&prefix) {
        return (mime.to_string(), MediaClass::from_mime(mime));
    }
    if let Some(mime) = mime_from_extension(path) {
        return (mime.to_string(), MediaClass::from_mime(mime));
    }
    ("*".to_string(), MediaClass::Item)
}

fn sniff_magic(prefix: &[u8]) -> Option<&'static str> {
    if prefix.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if prefix.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if prefix.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    if prefix.starts_with(b"fLaC") {
        return Some("audio/flac");
    }
    if prefix.starts_with(b"ID3")
        || (prefix.len() >= 2 && prefix[0] == 0xFF && matches!(prefix[1], 0xFB | 0xF3 | 0xF2))
    {
        return Some("audio/mpeg");
    }
    if prefix.starts_with(b"OggS") {
        return Some("application/ogg");
    }
    if prefix.len() >= 12 && &prefix[..4] == b"RIFF" {
        if &prefix[8..12] == b"WAVE" {
            return Some("audio/x-wav");
        }
        if &prefix[8..12] == b"AVI " {
            return Some("video/x-msvideo");
        }
    }
    if prefix.len() >= 12 && &prefix[4..8] == b"ftyp" {
        if &prefix[8..11] == b"M4A" {
            return Some("audio/mp4");
        }
        return Some("video/mp4");
    }
    if prefix.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some("video/x-matroska");
    }
    if prefix.starts_with(&[0x00, 0x00, 0x01, 0xBA]) || prefix.starts_with(&[0x00, 0x00, 0x01, 0xB3])
    {
        return Some("video/mpeg");
    }
    None
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    const FORMATS: &[(&str, &str)] = &[
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("gif", "image/gif"),
        ("mp3", "audio/mpeg"),
        ("m4a", "audio/mp4"),
        ("flac", "audio/flac"),
        ("wma", "audio/x-ms-wma"),
        ("wav", "audio/x-wav"),
        ("pcm", "audio/L16"),
        ("ogg", "application/ogg"),
        ("avi", "video/x-msvideo"),
        ("mpg", "video/mpeg"),
        ("mp4", "video/mp4"),
        ("mkv", "video/x-matroska"),
        ("wmv", "video/x-ms-wmv"),
        ("flv", "video/x-flv"),
        ("mov", "video/quicktime"),
        ("3gp", "video/3gpp"),
    ];

    let ext = path.extension()?.to_str()?.to_lowercase();
    FORMATS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}
