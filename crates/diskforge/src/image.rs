//! Disk image assembly.
//!
//! ```text
//! 0               loader_region     +kernel         +manifest
//! [ loader + pad ][ kernel binary ][ manifest ][ asset bytes in id order ]
//! ```
//!
//! The loader region carries a [`SegmentTable`] at `table_offset` so the
//! loader can find the kernel and the kernel can find its filesystem. The
//! loader binary must leave those bytes zero.

use crate::context::BuildContext;
use crate::error::{BuildError, IoContext, Result, Stage};
use crate::layout::LinkedBinary;
use crate::manifest::{AssetTable, Manifest};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_TABLE_OFFSET: u64 = 0x1DE;

/// Where every segment lives in the image. All offsets are absolute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    pub kernel_offset: u32,
    pub kernel_size: u32,
    pub kernel_entry: u32,
    pub manifest_offset: u32,
    pub manifest_size: u32,
    pub assets_offset: u32,
    pub assets_size: u32,
}

impl SegmentTable {
    pub const MAGIC: &'static [u8; 4] = b"DFSG";
    pub const LEN: usize = 32;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(Self::MAGIC);
        let fields = [
            self.kernel_offset,
            self.kernel_size,
            self.kernel_entry,
            self.manifest_offset,
            self.manifest_size,
            self.assets_offset,
            self.assets_size,
        ];
        for (chunk, value) in out[4..].chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(BuildError::MalformedImage(
                "segment table is truncated".to_string(),
            ));
        }
        if &bytes[..4] != Self::MAGIC {
            return Err(BuildError::MalformedImage(
                "segment table magic not found".to_string(),
            ));
        }
        let mut fields = bytes[4..Self::LEN]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || fields.next().unwrap_or_default();
        Ok(SegmentTable {
            kernel_offset: next(),
            kernel_size: next(),
            kernel_entry: next(),
            manifest_offset: next(),
            manifest_size: next(),
            assets_offset: next(),
            assets_size: next(),
        })
    }

    /// Total image size described by the table.
    pub fn image_size(&self) -> u64 {
        u64::from(self.assets_offset) + u64::from(self.assets_size)
    }
}

/// Fixed geometry of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub loader_region: u64,
    pub table_offset: u64,
    pub kernel_capacity: Option<u64>,
}

impl Default for ImageLayout {
    fn default() -> Self {
        ImageLayout {
            loader_region: 512,
            table_offset: DEFAULT_TABLE_OFFSET,
            kernel_capacity: None,
        }
    }
}

/// A written image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutput {
    pub path: PathBuf,
    pub size: u64,
    pub table: SegmentTable,
    /// Lowercase hex SHA-256 of the image bytes.
    pub sha256: String,
}

pub struct ImageAssembler<'a> {
    ctx: &'a BuildContext,
    loader: PathBuf,
    layout: ImageLayout,
    output: PathBuf,
}

fn overflow(segment: &str, size: u64, capacity: u64) -> BuildError {
    BuildError::LayoutOverflow {
        stage: Stage::Image,
        segment: segment.to_string(),
        size,
        capacity,
    }
}

fn to_u32(segment: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| overflow(segment, value, u64::from(u32::MAX)))
}

impl<'a> ImageAssembler<'a> {
    pub fn new(
        ctx: &'a BuildContext,
        loader: impl Into<PathBuf>,
        layout: ImageLayout,
        output: impl Into<PathBuf>,
    ) -> Self {
        ImageAssembler {
            ctx,
            loader: loader.into(),
            layout,
            output: output.into(),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Concatenate every segment into the output image.
    ///
    /// Either the whole image appears at the output path or nothing does;
    /// an image from an earlier run is removed first.
    pub fn assemble(&self, kernel: &LinkedBinary, assets: &AssetTable) -> Result<ImageOutput> {
        remove_if_exists(&self.output)?;
        self.ctx.prepare_stage(Stage::Image)?;

        let loader = self.loader_region()?;
        let manifest = assets.manifest().encode()?;

        if let Some(capacity) = self.layout.kernel_capacity {
            if kernel.len() > capacity {
                return Err(overflow("kernel", kernel.len(), capacity));
            }
        }

        let kernel_offset = self.layout.loader_region;
        let manifest_offset = kernel_offset + kernel.len();
        let assets_offset = manifest_offset + manifest.len() as u64;
        let assets_size = assets.manifest().total_size();
        let total = assets_offset + assets_size;
        if total > u64::from(u32::MAX) {
            return Err(overflow("image", total, u64::from(u32::MAX)));
        }

        let table = SegmentTable {
            kernel_offset: to_u32("kernel", kernel_offset)?,
            kernel_size: to_u32("kernel", kernel.len())?,
            kernel_entry: to_u32("kernel", kernel_offset + kernel.entry_offset)?,
            manifest_offset: to_u32("manifest", manifest_offset)?,
            manifest_size: to_u32("manifest", manifest.len() as u64)?,
            assets_offset: to_u32("assets", assets_offset)?,
            assets_size: to_u32("assets", assets_size)?,
        };

        let mut region = loader;
        let start = usize::try_from(self.layout.table_offset)
            .map_err(|_| overflow("loader", self.layout.table_offset, self.layout.loader_region))?;
        region[start..start + SegmentTable::LEN].copy_from_slice(&table.encode());

        let partial = partial_path(&self.output);
        let sha256 = {
            let guard = PartialFile(&partial);
            let digest = write_image(&partial, &region, kernel, &manifest, assets)?;
            std::fs::rename(&partial, &self.output).at(Stage::Image, &self.output)?;
            std::mem::forget(guard);
            digest
        };

        info!(
            "[image] wrote {} ({total} bytes, {} asset(s))",
            self.output.display(),
            assets.manifest().len()
        );
        Ok(ImageOutput {
            path: self.output.clone(),
            size: total,
            table,
            sha256,
        })
    }

    /// Loader bytes zero-padded to the region, with the table slot checked.
    fn loader_region(&self) -> Result<Vec<u8>> {
        let mut loader = std::fs::read(&self.loader).at(Stage::Image, &self.loader)?;
        let size = loader.len() as u64;
        if size > self.layout.loader_region {
            return Err(overflow("loader", size, self.layout.loader_region));
        }

        let table_end = self.layout.table_offset + SegmentTable::LEN as u64;
        if table_end > self.layout.loader_region {
            return Err(overflow(
                "loader",
                table_end,
                self.layout.loader_region,
            ));
        }
        let region = usize::try_from(self.layout.loader_region)
            .map_err(|_| overflow("loader", size, self.layout.loader_region))?;
        loader.resize(region, 0);

        let start = usize::try_from(self.layout.table_offset)
            .map_err(|_| overflow("loader", size, self.layout.table_offset))?;
        if loader[start..start + SegmentTable::LEN].iter().any(|&b| b != 0) {
            return Err(overflow("loader", size, self.layout.table_offset));
        }
        Ok(loader)
    }
}

/// Removes a half-written image unless forgotten.
struct PartialFile<'p>(&'p Path);

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(BuildError::io(Stage::Image, path, e))
        }
        _ => Ok(()),
    }
}

/// Write all segments to `path`, returning the hex digest of what was written.
fn write_image(
    path: &Path,
    region: &[u8],
    kernel: &LinkedBinary,
    manifest: &[u8],
    assets: &AssetTable,
) -> Result<String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).at(Stage::Image, parent)?;
    }
    let file = File::create(path).at(Stage::Image, path)?;
    let mut out = BufWriter::new(file);
    let mut hasher = Sha256::new();

    let mut put = |bytes: &[u8]| -> Result<()> {
        hasher.update(bytes);
        out.write_all(bytes).at(Stage::Image, path)
    };

    put(region)?;
    put(&kernel.bytes)?;
    put(manifest)?;
    for (entry, file) in assets.iter() {
        let bytes = std::fs::read(file).at(Stage::Image, file)?;
        if bytes.len() as u64 != entry.size {
            return Err(BuildError::io(
                Stage::Image,
                file,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "asset '{}' changed since scan ({} bytes, expected {})",
                        entry.path,
                        bytes.len(),
                        entry.size
                    ),
                ),
            ));
        }
        put(&bytes)?;
    }

    out.flush().at(Stage::Image, path)?;
    out.get_ref().sync_all().at(Stage::Image, path)?;
    Ok(hex(&hasher.finalize()))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decoded view of an assembled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub size: u64,
    pub table: SegmentTable,
    pub manifest: Manifest,
}

impl ImageSummary {
    /// Bytes of asset `id` inside `image`.
    pub fn asset<'i>(&self, image: &'i [u8], id: u32) -> Option<&'i [u8]> {
        let mut offset = u64::from(self.table.assets_offset);
        for entry in self.manifest.entries() {
            if entry.id == id {
                let start = usize::try_from(offset).ok()?;
                let end = start.checked_add(usize::try_from(entry.size).ok()?)?;
                return image.get(start..end);
            }
            offset += entry.size;
        }
        None
    }

    /// The kernel segment inside `image`.
    pub fn kernel<'i>(&self, image: &'i [u8]) -> Option<&'i [u8]> {
        let start = self.table.kernel_offset as usize;
        image.get(start..start + self.table.kernel_size as usize)
    }
}

/// Decode the segment table and manifest of `image`.
pub fn inspect(image: &[u8], table_offset: u64) -> Result<ImageSummary> {
    let start = usize::try_from(table_offset)
        .ok()
        .filter(|&s| s.saturating_add(SegmentTable::LEN) <= image.len())
        .ok_or_else(|| BuildError::MalformedImage("image is smaller than its loader region".to_string()))?;
    let table = SegmentTable::decode(&image[start..])?;

    let size = image.len() as u64;
    if table.image_size() != size {
        return Err(BuildError::MalformedImage(format!(
            "segment table describes {} bytes but the image has {size}",
            table.image_size()
        )));
    }
    if u64::from(table.kernel_offset) + u64::from(table.kernel_size)
        != u64::from(table.manifest_offset)
        || u64::from(table.manifest_offset) + u64::from(table.manifest_size)
            != u64::from(table.assets_offset)
    {
        return Err(BuildError::MalformedImage(
            "segments are not contiguous".to_string(),
        ));
    }

    let manifest_start = table.manifest_offset as usize;
    let manifest_end = manifest_start + table.manifest_size as usize;
    let (manifest, used) = Manifest::decode(&image[manifest_start..manifest_end])?;
    if used != table.manifest_size as usize {
        return Err(BuildError::MalformedImage(format!(
            "manifest uses {used} of its {} bytes",
            table.manifest_size
        )));
    }
    if manifest.total_size() != u64::from(table.assets_size) {
        return Err(BuildError::MalformedImage(format!(
            "manifest lists {} asset bytes but the segment holds {}",
            manifest.total_size(),
            table.assets_size
        )));
    }

    Ok(ImageSummary {
        size,
        table,
        manifest,
    })
}
