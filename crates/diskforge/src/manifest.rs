//! Filesystem manifest generation.
//!
//! The asset tree is walked, every regular file or symlink that is not
//! hidden becomes an asset, and ids are handed out densely from 1 in
//! byte-wise path order. The same tree always yields the same manifest.
//!
//! Binary format (version 1, little-endian):
//!
//! ```text
//! "DFMF" | u16 version | u16 reserved | u32 count
//! count x { u32 id | u32 offset | u32 size | u16 path_len | path }
//! ```
//!
//! `offset` is relative to the first asset byte; assets are stored back to
//! back in id order.

use crate::error::{BuildError, IoContext, Result, Stage};
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 4] = b"DFMF";
pub const VERSION: u16 = 1;
const HEADER_LEN: usize = 12;
const RECORD_FIXED_LEN: usize = 14;

/// An asset before ids are assigned: where it goes and where its bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSource {
    /// Relative, `/`-separated path inside the filesystem.
    pub path: String,
    pub file: PathBuf,
    pub size: u64,
}

impl AssetSource {
    /// Describe an on-disk file that will be installed at `path`.
    pub fn from_file(stage: Stage, path: impl Into<String>, file: &Path) -> Result<Self> {
        let size = std::fs::metadata(file).at(stage, file)?.len();
        Ok(AssetSource {
            path: path.into(),
            file: file.to_path_buf(),
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    pub id: u32,
    pub path: String,
    pub size: u64,
}

/// Immutable id assignment for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<AssetEntry>,
}

/// A manifest together with the files backing each entry, in id order.
#[derive(Debug, Clone, Default)]
pub struct AssetTable {
    manifest: Manifest,
    files: Vec<PathBuf>,
}

impl AssetTable {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// `(entry, backing file)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&AssetEntry, &Path)> {
        self.manifest
            .entries
            .iter()
            .zip(self.files.iter().map(PathBuf::as_path))
    }
}

/// Walks an asset root.
pub struct FilesystemManifestGenerator {
    root: PathBuf,
}

impl FilesystemManifestGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemManifestGenerator { root: root.into() }
    }

    /// Every non-hidden regular file or symlink below the root, without
    /// following symlinks.
    ///
    /// Directories themselves are not assets. A missing root is an I/O
    /// error; an empty one yields no assets.
    pub fn scan(&self) -> Result<Vec<AssetSource>> {
        let root = self.root.as_path();
        let meta = std::fs::metadata(root).at(Stage::Filesystem, root)?;
        if !meta.is_dir() {
            return Err(BuildError::io(
                Stage::Filesystem,
                root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "asset root is not a directory"),
            ));
        }

        let mut found = Vec::new();
        walk(root, "", &mut found)?;
        info!("[filesystem] scanned {} asset(s) under {}", found.len(), root.display());
        Ok(found)
    }

    /// Scan, add `installed` entries, and assign ids.
    pub fn generate(&self, installed: Vec<AssetSource>) -> Result<AssetTable> {
        let mut sources = self.scan()?;
        sources.extend(installed);
        Manifest::assign(sources)
    }
}

fn walk(dir: &Path, prefix: &str, found: &mut Vec<AssetSource>) -> Result<()> {
    for entry in std::fs::read_dir(dir).at(Stage::Filesystem, dir)? {
        let entry = entry.at(Stage::Filesystem, dir)?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(BuildError::io(
                Stage::Filesystem,
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "asset name is not valid UTF-8"),
            ));
        };
        if name.starts_with('.') {
            debug!("[filesystem] skipping hidden {}", path.display());
            continue;
        }

        let relative = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        let meta = std::fs::symlink_metadata(&path).at(Stage::Filesystem, &path)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            walk(&path, &relative, found)?;
        } else if file_type.is_symlink() {
            // Contents are read through the link, so size the target.
            let target = std::fs::metadata(&path).at(Stage::Filesystem, &path)?;
            if target.is_dir() {
                debug!("[filesystem] not following directory link {}", path.display());
                continue;
            }
            found.push(AssetSource {
                path: relative,
                file: path,
                size: target.len(),
            });
        } else if file_type.is_file() {
            found.push(AssetSource {
                path: relative,
                file: path,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

impl Manifest {
    /// Sort by path and number from 1. Duplicate paths are an error.
    pub fn assign(sources: Vec<AssetSource>) -> Result<AssetTable> {
        let mut by_path = BTreeMap::new();
        for source in sources {
            if by_path.contains_key(&source.path) {
                return Err(BuildError::ConflictingAsset {
                    stage: Stage::Filesystem,
                    path: source.path,
                });
            }
            by_path.insert(source.path.clone(), source);
        }

        let mut entries = Vec::with_capacity(by_path.len());
        let mut files = Vec::with_capacity(by_path.len());
        for (i, (path, source)) in by_path.into_iter().enumerate() {
            let id = u32::try_from(i + 1).map_err(|_| BuildError::LayoutOverflow {
                stage: Stage::Filesystem,
                segment: "manifest".to_string(),
                size: i as u64 + 1,
                capacity: u64::from(u32::MAX),
            })?;
            entries.push(AssetEntry {
                id,
                path,
                size: source.size,
            });
            files.push(source.file);
        }

        Ok(AssetTable {
            manifest: Manifest { entries },
            files,
        })
    }

    pub fn entries(&self) -> &[AssetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&AssetEntry> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.entries.get(index)
    }

    pub fn find(&self, path: &str) -> Option<&AssetEntry> {
        self.entries
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Sum of all asset sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Serialize in the v1 binary layout.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let overflow = |segment: &str, size: u64, capacity: u64| BuildError::LayoutOverflow {
            stage: Stage::Filesystem,
            segment: segment.to_string(),
            size,
            capacity,
        };

        let count = u32::try_from(self.entries.len())
            .map_err(|_| overflow("manifest", self.entries.len() as u64, u64::from(u32::MAX)))?;
        let mut out = Vec::with_capacity(
            HEADER_LEN
                + self
                    .entries
                    .iter()
                    .map(|e| RECORD_FIXED_LEN + e.path.len())
                    .sum::<usize>(),
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());

        let mut offset = 0u64;
        for entry in &self.entries {
            let off32 = u32::try_from(offset)
                .map_err(|_| overflow("assets", offset, u64::from(u32::MAX)))?;
            let size32 = u32::try_from(entry.size)
                .map_err(|_| overflow(&entry.path, entry.size, u64::from(u32::MAX)))?;
            let path_len = u16::try_from(entry.path.len()).map_err(|_| {
                overflow(&entry.path, entry.path.len() as u64, u64::from(u16::MAX))
            })?;

            out.extend_from_slice(&entry.id.to_le_bytes());
            out.extend_from_slice(&off32.to_le_bytes());
            out.extend_from_slice(&size32.to_le_bytes());
            out.extend_from_slice(&path_len.to_le_bytes());
            out.extend_from_slice(entry.path.as_bytes());
            offset += entry.size;
        }
        Ok(out)
    }

    /// Parse a v1 manifest, returning it and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(malformed("bad magic"));
        }
        let version = reader.u16()?;
        if version != VERSION {
            return Err(malformed(format!("unsupported version {version}")));
        }
        reader.u16()?;
        let count = reader.u32()?;

        let mut entries: Vec<AssetEntry> = Vec::new();
        let mut expected_offset = 0u64;
        for index in 1..=count {
            let id = reader.u32()?;
            let offset = reader.u32()?;
            let size = reader.u32()?;
            let path_len = reader.u16()?;
            let path = std::str::from_utf8(reader.take(usize::from(path_len))?)
                .map_err(|_| malformed(format!("record {id}: path is not UTF-8")))?
                .to_string();

            if id != index {
                return Err(malformed(format!("record {index} carries id {id}")));
            }
            if u64::from(offset) != expected_offset {
                return Err(malformed(format!(
                    "record {id}: offset {offset} does not follow previous asset"
                )));
            }
            if entries.last().is_some_and(|prev| prev.path.as_str() >= path.as_str()) {
                return Err(malformed(format!("record {id}: '{path}' is out of order")));
            }
            expected_offset += u64::from(size);
            entries.push(AssetEntry {
                id,
                path,
                size: u64::from(size),
            });
        }
        Ok((Manifest { entries }, reader.pos))
    }

    /// One `file <id>,"<path>"` line per asset.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("file {},\"{}\"\n", entry.id, entry.path));
        }
        out
    }
}

fn malformed(detail: impl Into<String>) -> BuildError {
    BuildError::MalformedManifest(detail.into())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| malformed(format!("truncated at byte {}", self.pos)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
