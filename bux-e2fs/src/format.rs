//! The Formatter: writes a fresh ext4 image into a block file.
//!
//! Everything is buffered in memory (inode table, directory trees, block
//! contents queued for the bump allocator) and materialized in one shot at
//! [`Formatter::close`]. Rootfs images built by this crate are small enough
//! (container layers, not multi-gigabyte volumes) that this is simpler than
//! incremental on-disk bookkeeping and avoids seek-heavy partial writes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::dirent::{self, DirEntry};
use crate::extent::Extent;
use crate::inode::{self, EXT4_EXTENTS_FL, InodeFields, S_IFDIR, S_IFLNK, S_IFREG};
use crate::layout::{BlockAllocator, Layout};
use crate::{BLOCK_SIZE, Error, FIRST_FREE_INO, ROOT_INO, Result};

/// Fast-symlink threshold: targets shorter than this are inlined into the
/// inode's `i_block` area instead of being given their own extent.
const FAST_SYMLINK_MAX: usize = 59;

#[derive(Debug, Clone)]
struct PendingInode {
    fields: InodeFields,
    children: BTreeMap<String, (u32, u8)>,
}

/// Builds a fresh ext4 image, buffering content in memory until [`close`]
/// materializes the on-disk layout.
///
/// [`close`]: Formatter::close
pub struct Formatter {
    layout: Layout,
    inodes: BTreeMap<u32, PendingInode>,
    paths: BTreeMap<String, u32>,
    /// File/long-symlink content queued for allocation at `close()`.
    pending_files: BTreeMap<u32, Vec<u8>>,
    next_ino: u32,
    mkfs_time: u32,
}

impl Formatter {
    /// Creates a Formatter targeting an image of at least `min_disk_size`
    /// bytes, rounded up to a whole number of blocks.
    pub fn create(min_disk_size: u64, mkfs_time: u32) -> Result<Self> {
        let total_blocks = min_disk_size.div_ceil(u64::from(BLOCK_SIZE)).max(2048);
        // A rough floor: one inode per 16 KiB of image, never fewer than 256.
        let min_inodes = ((total_blocks * u64::from(BLOCK_SIZE)) / 16384).max(256) as u32;
        let layout = Layout::new(total_blocks, min_inodes)?;

        let mut inodes = BTreeMap::new();
        inodes.insert(
            ROOT_INO,
            PendingInode {
                fields: InodeFields {
                    mode: S_IFDIR | 0o755,
                    links_count: 2,
                    mtime: mkfs_time,
                    flags: EXT4_EXTENTS_FL,
                    ..Default::default()
                },
                children: BTreeMap::new(),
            },
        );

        let mut paths = BTreeMap::new();
        paths.insert(String::new(), ROOT_INO);

        let mut fmt = Self {
            layout,
            inodes,
            paths,
            pending_files: BTreeMap::new(),
            next_ino: FIRST_FREE_INO,
            mkfs_time,
        };
        fmt.create_dir_all("lost+found", 0o700)?;
        Ok(fmt)
    }

    fn normalize(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect()
    }

    fn alloc_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Ensures every parent component of `components` exists as a directory,
    /// auto-creating missing ones as mode `0o755`. Returns the parent inode
    /// number and the final component name.
    fn resolve_parent(&mut self, components: &[String]) -> Result<(u32, String)> {
        let Some((name, parents)) = components.split_last() else {
            return Err(Error::InvalidPath("empty path".into()));
        };

        let mut cur = ROOT_INO;
        let mut cur_path = String::new();
        for p in parents {
            cur_path = if cur_path.is_empty() {
                p.clone()
            } else {
                format!("{cur_path}/{p}")
            };
            cur = match self.paths.get(&cur_path) {
                Some(&ino) => ino,
                None => self.insert_dir(cur, &cur_path, p.clone(), 0o755)?,
            };
        }
        Ok((cur, name.clone()))
    }

    fn insert_dir(&mut self, parent: u32, full_path: &str, name: String, mode: u16) -> Result<u32> {
        let ino = self.alloc_ino();
        self.inodes.insert(
            ino,
            PendingInode {
                fields: InodeFields {
                    mode: S_IFDIR | (mode & 0o7777),
                    links_count: 2,
                    mtime: self.mkfs_time,
                    flags: EXT4_EXTENTS_FL,
                    ..Default::default()
                },
                children: BTreeMap::new(),
            },
        );
        self.link_child(parent, name, ino, 2);
        self.paths.insert(full_path.to_string(), ino);
        Ok(ino)
    }

    /// Links `ino` as `name` under `parent`, overwriting any existing entry
    /// of that name (later layers shadow earlier ones).
    fn link_child(&mut self, parent: u32, name: String, ino: u32, file_type: u8) {
        if let Some(p) = self.inodes.get_mut(&parent) {
            p.children.insert(name, (ino, file_type));
        }
    }

    /// Materializes a directory inode at `path` (mode `0o755` by default via
    /// [`resolve_parent`]; pass the requested mode explicitly here).
    pub fn create_dir_all(&mut self, path: &str, mode: u16) -> Result<()> {
        let components = Self::normalize(path);
        if components.is_empty() {
            return Ok(());
        }
        let mut cur_path = String::new();
        for c in &components {
            cur_path = if cur_path.is_empty() {
                c.clone()
            } else {
                format!("{cur_path}/{c}")
            };
            if self.paths.contains_key(&cur_path) {
                continue;
            }
            let parent_path: String = cur_path
                .rsplit_once('/')
                .map(|(p, _)| p.to_string())
                .unwrap_or_default();
            let parent = *self.paths.get(&parent_path).unwrap_or(&ROOT_INO);
            self.insert_dir(parent, &cur_path, c.clone(), mode)?;
        }
        Ok(())
    }

    /// Materializes a regular file at `path`, consuming bytes from `stream`.
    ///
    /// Content is staged fully in memory and handed to the bump allocator at
    /// [`close`](Self::close), since a file's extents must be placed
    /// contiguously once its final size is known.
    pub fn create_file(&mut self, path: &str, mode: u16, mut stream: impl Read) -> Result<()> {
        let components = Self::normalize(path);
        let (parent, name) = self.resolve_parent(&components)?;

        let mut content = Vec::new();
        stream.read_to_end(&mut content)?;
        let total = content.len() as u64;

        let ino = self.alloc_ino();
        self.inodes.insert(
            ino,
            PendingInode {
                fields: InodeFields {
                    mode: S_IFREG | (mode & 0o7777),
                    links_count: 1,
                    mtime: self.mkfs_time,
                    flags: EXT4_EXTENTS_FL,
                    size: total,
                    ..Default::default()
                },
                children: BTreeMap::new(),
            },
        );
        self.pending_files.insert(ino, content);

        self.link_child(parent, name, ino, 1);
        self.paths.insert(cur_full(&components), ino);
        Ok(())
    }

    /// Materializes a symbolic link at `linkPath` pointing at `target`.
    pub fn create_symlink(&mut self, link_path: &str, target: &str, mode: u16) -> Result<()> {
        let components = Self::normalize(link_path);
        let (parent, name) = self.resolve_parent(&components)?;

        let ino = self.alloc_ino();
        let mut fields = InodeFields {
            mode: S_IFLNK | (mode & 0o7777),
            links_count: 1,
            mtime: self.mkfs_time,
            size: target.len() as u64,
            ..Default::default()
        };

        if target.len() <= FAST_SYMLINK_MAX {
            fields.i_block[..target.len()].copy_from_slice(target.as_bytes());
        } else {
            fields.flags |= EXT4_EXTENTS_FL;
            self.pending_files.insert(ino, target.as_bytes().to_vec());
        }

        self.inodes.insert(
            ino,
            PendingInode {
                fields,
                children: BTreeMap::new(),
            },
        );
        self.link_child(parent, name, ino, 7);
        let full = cur_full(&components);
        self.paths.insert(full, ino);
        Ok(())
    }

    /// Removes a previously added path and everything beneath it (an OCI
    /// layer whiteout entry).
    pub fn remove_path(&mut self, path: &str) {
        let components = Self::normalize(path);
        let Some((name, parents)) = components.split_last() else {
            return;
        };
        let parent_path = parents.join("/");
        let full_path = components.join("/");
        if let Some(&parent) = self.paths.get(&parent_path).or(Some(&ROOT_INO)) {
            if let Some(p) = self.inodes.get_mut(&parent) {
                p.children.remove(name);
            }
        }
        self.paths.remove(&full_path);
    }

    /// Clears a directory's inherited children without removing the
    /// directory itself (an OCI opaque whiteout, `.wh..wh..opq`).
    ///
    /// Descendant entries are dropped from the path index too, so a later
    /// lookup under the cleared subtree falls through to `resolve_parent`'s
    /// auto-create rather than resolving a now-dangling inode.
    fn clear_dir_children(&mut self, path: &str) {
        let components = Self::normalize(path);
        let full_path = components.join("/");
        let Some(&ino) = self.paths.get(&full_path) else {
            return;
        };
        if let Some(dir) = self.inodes.get_mut(&ino) {
            dir.children.clear();
        }
        self.paths.retain(|p, _| {
            if p == &full_path {
                return true;
            }
            let p_components = Self::normalize(p);
            p_components.len() <= components.len() || p_components[..components.len()] != components[..]
        });
    }

    /// Streams a `paxRestricted`-format tar archive (optionally gzip
    /// compressed) through, creating/overwriting/removing entries as an OCI
    /// layer overlay.
    pub fn unpack(&mut self, reader: impl Read, gzip: bool) -> Result<()> {
        if gzip {
            let gz = flate2::read::GzDecoder::new(reader);
            self.unpack_tar(gz)
        } else {
            self.unpack_tar(reader)
        }
    }

    fn unpack_tar(&mut self, reader: impl Read) -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap_or(0o644) as u16;

            if let Some(file_name) = Path::new(&path).file_name().and_then(|n| n.to_str()) {
                let parent_dir = Path::new(&path)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();

                if file_name == ".wh..wh..opq" {
                    self.clear_dir_children(&parent_dir);
                    continue;
                }

                if let Some(target_name) = file_name.strip_prefix(".wh.") {
                    let target = if parent_dir.is_empty() {
                        target_name.to_string()
                    } else {
                        format!("{parent_dir}/{target_name}")
                    };
                    self.remove_path(&target);
                    continue;
                }
            }

            use tar::EntryType as T;
            match entry.header().entry_type() {
                T::Directory => {
                    self.create_dir_all(&path, mode)?;
                }
                T::Symlink | T::Link => {
                    let target = entry
                        .link_name()?
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.create_symlink(&path, &target, mode)?;
                }
                _ => {
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf)?;
                    self.create_file(&path, mode, &buf[..])?;
                }
            }
        }
        Ok(())
    }

    /// Flushes bitmaps, inode tables, group descriptors, and superblocks to
    /// `out`, yielding a standalone ext4 image.
    pub fn close(mut self, out: &mut File) -> Result<()> {
        let layout = self.layout;
        out.set_len(u64::from(layout.block_size) * layout.total_blocks)?;

        let mut alloc = BlockAllocator::new(&layout);
        let mut block_cache: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

        // Place file/symlink content and build each inode's extent list.
        let mut extents_by_ino: BTreeMap<u32, Vec<Extent>> = BTreeMap::new();
        let pending = std::mem::take(&mut self.pending_files);
        for (ino, content) in pending {
            if content.is_empty() {
                continue;
            }
            let nblocks = (content.len() as u64).div_ceil(u64::from(layout.block_size));
            let start = alloc.alloc_run(nblocks)?;
            for (i, chunk) in content.chunks(layout.block_size as usize).enumerate() {
                let mut block = vec![0u8; layout.block_size as usize];
                block[..chunk.len()].copy_from_slice(chunk);
                block_cache.insert(start + i as u64, block);
            }
            // The allocator handed back one contiguous run, but a single
            // extent's length field can't exceed crate::extent::MAX_EXTENT_LEN,
            // so split large files into consecutive extents over that run.
            let mut exts = Vec::new();
            let mut remaining = nblocks;
            let mut logical = 0u32;
            let mut physical = start;
            while remaining > 0 {
                let len = remaining.min(u64::from(crate::extent::MAX_EXTENT_LEN));
                exts.push(Extent {
                    logical_start: logical,
                    len: len as u32,
                    physical_start: physical,
                });
                logical += len as u32;
                physical += len;
                remaining -= len;
            }
            extents_by_ino.insert(ino, exts);
        }

        // Directory blocks.
        for (ino, pinode) in &self.inodes {
            if pinode.fields.mode & 0xF000 != S_IFDIR {
                continue;
            }
            let mut entries = Vec::new();
            for (name, &(child_ino, ft)) in &pinode.children {
                entries.push(DirEntry {
                    name: name.clone(),
                    inode: child_ino,
                    file_type: ft,
                });
            }
            let blocks = dirent::pack_blocks(&entries);
            let nblocks = blocks.len() as u64;
            let start = alloc.alloc_run(nblocks)?;
            for (i, b) in blocks.into_iter().enumerate() {
                block_cache.insert(start + i as u64, b);
            }
            extents_by_ino.insert(
                *ino,
                vec![Extent {
                    logical_start: 0,
                    len: nblocks as u32,
                    physical_start: start,
                }],
            );
        }

        // Encode every inode, writing external extent leaf blocks as needed.
        let itable_blocks = (FIRST_FREE_INO..self.next_ino)
            .chain(std::iter::once(ROOT_INO))
            .collect::<std::collections::BTreeSet<_>>();
        let mut inode_bytes: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for ino in itable_blocks {
            let Some(pinode) = self.inodes.get(&ino) else {
                continue;
            };
            let mut fields = pinode.fields;
            let is_dir = fields.mode & 0xF000 == S_IFDIR;
            let is_fast_symlink = fields.mode & 0xF000 == S_IFLNK && fields.flags & EXT4_EXTENTS_FL == 0;

            if !is_fast_symlink {
                if let Some(exts) = extents_by_ino.get(&ino) {
                    let mut i_block = [0u8; 60];
                    let leaf = crate::extent::encode(
                        exts,
                        &mut i_block,
                        || alloc.alloc_run(1).expect("extent leaf block"),
                        layout.block_size,
                    );
                    if let Some((block_no, data)) = leaf {
                        block_cache.insert(block_no, data);
                    }
                    fields.i_block = i_block;
                    fields.flags |= EXT4_EXTENTS_FL;
                    let total_blocks: u64 = exts.iter().map(|e| u64::from(e.len)).sum();
                    fields.blocks_512 = (total_blocks * u64::from(layout.block_size) / 512) as u32;
                } else if is_dir {
                    // Empty directory shouldn't happen (every dir has at least
                    // "." / ".." worth of content via its parent link), but guard anyway.
                    fields.blocks_512 = 0;
                }
            }

            let mut buf = vec![0u8; layout.inode_size as usize];
            inode::write(&mut buf, &fields);
            inode_bytes.insert(ino, buf);
        }

        // Write inode tables.
        for g in 0..layout.num_groups {
            let table_start = layout.inode_table(g);
            let mut table = vec![0u8; layout.itable_blocks as usize * layout.block_size as usize];
            for local in 0..layout.inodes_per_group {
                let ino = g * layout.inodes_per_group + local + 1;
                if let Some(bytes) = inode_bytes.get(&ino) {
                    let off = local as usize * layout.inode_size as usize;
                    table[off..off + bytes.len()].copy_from_slice(bytes);
                }
            }
            for (i, chunk) in table.chunks(layout.block_size as usize).enumerate() {
                out.seek_write_block(table_start + i as u64, chunk, layout.block_size)?;
            }
        }

        // Write data/directory/extent-leaf blocks.
        for (block_no, data) in &block_cache {
            out.seek_write_block(*block_no, data, layout.block_size)?;
        }

        // Block and inode bitmaps: mark every block below the allocator's
        // cursor (plus fixed overhead) as used, and every allocated inode.
        let used_data_end = alloc.used_blocks() + layout.group_data_start(0);
        for g in 0..layout.num_groups {
            let mut bitmap = vec![0u8; layout.block_size as usize];
            let group_start = layout.group_start(g);
            let group_end = layout.group_end(g);
            for b in group_start..group_end {
                let used = b < layout.group_data_start(g) || b < used_data_end;
                if used {
                    let idx = (b - group_start) as usize;
                    bitmap[idx / 8] |= 1 << (idx % 8);
                }
            }
            out.seek_write_block(layout.block_bitmap(g), &bitmap, layout.block_size)?;

            let mut ibitmap = vec![0u8; layout.block_size as usize];
            for local in 0..layout.inodes_per_group {
                let ino = g * layout.inodes_per_group + local + 1;
                let used = ino < FIRST_FREE_INO || self.inodes.contains_key(&ino);
                if used {
                    ibitmap[(local / 8) as usize] |= 1 << (local % 8);
                }
            }
            out.seek_write_block(layout.inode_bitmap(g), &ibitmap, layout.block_size)?;
        }

        // Superblock + group descriptor table in every group (no sparse_super).
        let free_blocks = layout.total_blocks - used_data_end;
        let free_inodes = (layout.inodes_per_group * layout.num_groups) - self.inodes.len() as u32;
        let used_dirs = self
            .inodes
            .values()
            .filter(|p| p.fields.mode & 0xF000 == S_IFDIR)
            .count() as u32;

        let mut gdt = vec![0u8; layout.gdt_blocks as usize * layout.block_size as usize];
        for g in 0..layout.num_groups {
            superblock_group_desc(&mut gdt, &layout, g, free_blocks, free_inodes, used_dirs);
        }

        for g in 0..layout.num_groups {
            let mut sb_block = vec![0u8; layout.block_size as usize];
            crate::superblock::write(
                &mut sb_block,
                &layout,
                free_blocks,
                free_inodes,
                used_dirs,
                g as u16,
                self.mkfs_time,
            );
            out.seek_write_block(layout.group_start(g), &sb_block, layout.block_size)?;
            for (i, chunk) in gdt.chunks(layout.block_size as usize).enumerate() {
                out.seek_write_block(layout.group_start(g) + 1 + i as u64, chunk, layout.block_size)?;
            }
        }

        out.flush()?;
        Ok(())
    }
}

fn superblock_group_desc(
    gdt: &mut [u8],
    layout: &Layout,
    g: u32,
    free_blocks: u64,
    free_inodes: u32,
    used_dirs: u32,
) {
    crate::superblock::write_group_desc(
        gdt,
        layout,
        g,
        free_blocks.min(u64::from(layout.blocks_per_group)) as u16,
        free_inodes.min(layout.inodes_per_group) as u16,
        used_dirs.min(layout.inodes_per_group) as u16,
    );
}

fn cur_full(components: &[String]) -> String {
    components.join("/")
}

trait SeekWriteBlock {
    fn seek_write_block(&mut self, block: u64, data: &[u8], block_size: u32) -> Result<()>;
}

impl SeekWriteBlock for File {
    fn seek_write_block(&mut self, block: u64, data: &[u8], block_size: u32) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        self.seek(SeekFrom::Start(block * u64::from(block_size)))?;
        self.write_all(data)?;
        Ok(())
    }
}

/// Walks `rootfs` and estimates a minimum image size sufficient to hold its
/// contents plus metadata overhead, rounded up generously since the overlay
/// scheme means wasted base-image space costs nothing at runtime.
pub fn estimate_image_size(rootfs: &Path) -> Result<u64> {
    let mut total_bytes: u64 = 0;
    let mut entry_count: u64 = 0;
    walk(rootfs, &mut |_path, len| {
        total_bytes += len;
        entry_count += 1;
    })?;

    let data_blocks = total_bytes.div_ceil(u64::from(BLOCK_SIZE));
    let overhead_blocks = entry_count * 2 + 4096; // inode tables, dir blocks, bitmaps, slack
    let min_blocks = (data_blocks + overhead_blocks).max(4096);
    Ok(min_blocks * u64::from(BLOCK_SIZE))
}

fn walk(dir: &Path, f: &mut impl FnMut(&Path, u64)) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(&entry.path(), f)?;
        } else {
            f(&entry.path(), meta.len());
        }
    }
    Ok(())
}

/// Estimates a minimum image size for a sequence of OCI layer tar streams,
/// each `(path, gzip)`, without materializing their contents — walks tar
/// headers only.
pub fn estimate_layers_size(layers: &[(PathBuf, bool)]) -> Result<u64> {
    let mut total_bytes: u64 = 0;
    let mut entry_count: u64 = 0;
    for (path, gzip) in layers {
        let mut file = File::open(path)?;
        let sizer = |reader: &mut dyn Read| -> Result<()> {
            let mut archive = tar::Archive::new(reader);
            for entry in archive.entries()? {
                let entry = entry?;
                total_bytes += entry.header().size().unwrap_or(0);
                entry_count += 1;
            }
            Ok(())
        };
        if *gzip {
            sizer(&mut flate2::read::GzDecoder::new(file))?;
        } else {
            sizer(&mut file)?;
        }
    }

    let data_blocks = total_bytes.div_ceil(u64::from(BLOCK_SIZE));
    let overhead_blocks = entry_count * 2 + 4096;
    let min_blocks = (data_blocks + overhead_blocks).max(4096);
    Ok(min_blocks * u64::from(BLOCK_SIZE))
}

/// Builds a complete ext4 image at `dest` by driving [`Formatter::unpack`]
/// over each `(path, gzip)` layer tar stream in order — OCI layers never
/// touch an intermediate host directory.
pub fn create_from_layers(layers: &[(PathBuf, bool)], dest: &Path, min_size: u64) -> Result<()> {
    let mkfs_time = 0;
    let mut fmt = Formatter::create(min_size, mkfs_time)?;
    for (path, gzip) in layers {
        fmt.unpack(File::open(path)?, *gzip)?;
    }
    let mut file = File::create(dest)?;
    fmt.close(&mut file)
}

/// Builds a complete ext4 image at `dest` from the contents of `rootfs`,
/// sized to at least `min_size` bytes.
pub fn create_from_dir(rootfs: &Path, dest: &Path, min_size: u64) -> Result<()> {
    let mkfs_time = 0;
    let mut fmt = Formatter::create(min_size, mkfs_time)?;
    copy_tree(&mut fmt, rootfs, "")?;
    let mut file = File::create(dest)?;
    fmt.close(&mut file)
}

fn copy_tree(fmt: &mut Formatter, dir: &Path, rel: &str) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        let ft = entry.file_type()?;
        let meta = entry.metadata()?;
        let mode = unix_mode(&meta);

        if ft.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            fmt.create_symlink(&child_rel, &target.to_string_lossy(), mode)?;
        } else if ft.is_dir() {
            fmt.create_dir_all(&child_rel, mode)?;
            copy_tree(fmt, &entry.path(), &child_rel)?;
        } else {
            let file = File::open(entry.path())?;
            fmt.create_file(&child_rel, mode, file)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn unix_mode(meta: &std::fs::Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o7777) as u16
}

#[cfg(not(unix))]
fn unix_mode(_meta: &std::fs::Metadata) -> u16 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reader;

    fn build(fmt: &mut Formatter) -> Result<()> {
        fmt.create_dir_all("etc", 0o755)?;
        fmt.create_file("etc/hostname", 0o644, "sandbox\n".as_bytes())?;
        fmt.create_symlink("etc/mtab", "/proc/self/mounts", 0o777)?;
        fmt.create_dir_all("var/log", 0o755)?;
        let big = vec![b'x'; 3 * BLOCK_SIZE as usize + 17];
        fmt.create_file("var/log/big.log", 0o644, &big[..])?;
        Ok(())
    }

    #[test]
    fn round_trips_files_dirs_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ext4");

        let mut fmt = Formatter::create(16 * 1024 * 1024, 0).unwrap();
        build(&mut fmt).unwrap();
        let mut file = File::create(&path).unwrap();
        fmt.close(&mut file).unwrap();

        let mut reader = Reader::open(&path).unwrap();
        assert!(reader.exists("etc/hostname", true));
        assert!(reader.exists("/etc/hostname", true));
        assert!(!reader.exists("etc/nope", true));

        let contents = reader.read_file("etc/hostname", 0, None, true).unwrap();
        assert_eq!(contents, b"sandbox\n");

        let names = reader.list_directory("etc").unwrap();
        assert_eq!(names, vec!["hostname".to_string(), "mtab".to_string()]);

        let (_, stat) = reader.stat("etc/mtab", false).unwrap();
        assert_eq!(stat.mode & 0xF000, S_IFLNK);

        let big = reader.read_file("var/log/big.log", 0, None, true).unwrap();
        assert_eq!(big.len(), 3 * BLOCK_SIZE as usize + 17);
        assert!(big.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn partial_reads_respect_offset_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ext4");

        let mut fmt = Formatter::create(16 * 1024 * 1024, 0).unwrap();
        fmt.create_file("data.bin", 0o644, "0123456789".as_bytes())
            .unwrap();
        let mut file = File::create(&path).unwrap();
        fmt.close(&mut file).unwrap();

        let mut reader = Reader::open(&path).unwrap();
        let slice = reader.read_file("data.bin", 3, Some(4), true).unwrap();
        assert_eq!(slice, b"3456");

        let past_eof = reader.read_file("data.bin", 100, Some(4), true).unwrap();
        assert!(past_eof.is_empty());
    }

    #[test]
    fn unpack_applies_whiteouts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ext4");

        let tmp_tar = dir.path().join("layer.tar");
        {
            let mut builder = tar::Builder::new(File::create(&tmp_tar).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_path("keep.txt").unwrap();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, "hello".as_bytes()).unwrap();

            let mut wh_header = tar::Header::new_gnu();
            wh_header.set_path(".wh.keep.txt").unwrap();
            wh_header.set_size(0);
            wh_header.set_mode(0o644);
            wh_header.set_cksum();
            builder.append(&wh_header, &[][..]).unwrap();
            builder.finish().unwrap();
        }

        let mut fmt = Formatter::create(16 * 1024 * 1024, 0).unwrap();
        fmt.unpack(File::open(&tmp_tar).unwrap(), false).unwrap();
        let mut file = File::create(&path).unwrap();
        fmt.close(&mut file).unwrap();

        let mut reader = Reader::open(&path).unwrap();
        assert!(!reader.exists("keep.txt", true));
    }

    #[test]
    fn unpack_opaque_whiteout_clears_inherited_children() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.ext4");

        let mut fmt = Formatter::create(16 * 1024 * 1024, 0).unwrap();
        fmt.create_dir_all("app/data", 0o755).unwrap();
        fmt.create_file("app/data/old.txt", 0o644, "stale".as_bytes())
            .unwrap();

        let tmp_tar = dir.path().join("layer.tar");
        {
            let mut builder = tar::Builder::new(File::create(&tmp_tar).unwrap());

            let mut opq_header = tar::Header::new_gnu();
            opq_header.set_path("app/data/.wh..wh..opq").unwrap();
            opq_header.set_size(0);
            opq_header.set_mode(0o644);
            opq_header.set_cksum();
            builder.append(&opq_header, &[][..]).unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_path("app/data/new.txt").unwrap();
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, "new".as_bytes()).unwrap();
            builder.finish().unwrap();
        }

        fmt.unpack(File::open(&tmp_tar).unwrap(), false).unwrap();
        let mut file = File::create(&path).unwrap();
        fmt.close(&mut file).unwrap();

        let mut reader = Reader::open(&path).unwrap();
        assert!(!reader.exists("app/data/old.txt", true));
        assert!(reader.exists("app/data/new.txt", true));
        assert!(reader.exists("app/data", true));
    }
}
