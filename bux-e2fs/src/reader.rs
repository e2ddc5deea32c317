//! Reads a closed ext4 image back out by path, without mounting it.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::extent::Extent;
use crate::inode::{InodeFields, S_IFDIR, S_IFLNK, S_IFREG};
use crate::layout::Layout;
use crate::superblock::SuperblockInfo;
use crate::{BLOCK_SIZE, Error, MAX_SYMLINK_DEPTH, ROOT_INO, Result};

/// Largest single I/O this reader issues per extent overlap, mirroring the
/// builder's own block-at-a-time granularity but batched for throughput.
const MAX_IO_CHUNK: usize = 1024 * 1024;

/// Opens a previously closed image for path-level reads.
pub struct Reader {
    file: File,
    layout: Layout,
}

impl Reader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let total_len = file.metadata()?.len();

        let mut sb_buf = vec![0u8; 1024];
        file.seek(SeekFrom::Start(1024))?;
        file.read_exact(&mut sb_buf)?;
        let info: SuperblockInfo = crate::superblock::read(&sb_buf)?;

        let total_blocks = (total_len / u64::from(BLOCK_SIZE)).min(info.total_blocks);
        let gdt_blocks =
            (info.num_groups * crate::layout::GDT_ENTRY_SIZE).div_ceil(BLOCK_SIZE);
        let itable_bytes = u64::from(info.inodes_per_group) * u64::from(info.inode_size);
        let itable_blocks = itable_bytes.div_ceil(u64::from(BLOCK_SIZE)) as u32;
        let overhead_blocks = 1 + gdt_blocks + 1 + 1 + itable_blocks;

        let layout = Layout {
            block_size: BLOCK_SIZE,
            total_blocks,
            blocks_per_group: info.blocks_per_group,
            num_groups: info.num_groups,
            gdt_blocks,
            inodes_per_group: info.inodes_per_group,
            inode_size: info.inode_size,
            itable_blocks,
            overhead_blocks,
        };

        Ok(Self { file, layout })
    }

    fn read_block(&mut self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.layout.block_size as usize];
        self.file
            .seek(SeekFrom::Start(block * u64::from(self.layout.block_size)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_inode(&mut self, ino: u32) -> Result<InodeFields> {
        let (block, byte_off) = self.layout.inode_location(ino);
        let buf = self.read_block(block)?;
        let start = byte_off as usize;
        Ok(crate::inode::read(&buf[start..start + self.layout.inode_size as usize]))
    }

    fn read_dir_entries(&mut self, fields: &InodeFields) -> Result<Vec<crate::dirent::DirEntry>> {
        let extents = self.inode_extents(fields)?;
        let mut out = Vec::new();
        for e in extents {
            for b in 0..e.len {
                let block = self.read_block(e.physical_start + u64::from(b))?;
                out.extend(crate::dirent::parse_block(&block));
            }
        }
        Ok(out)
    }

    fn inode_extents(&mut self, fields: &InodeFields) -> Result<Vec<Extent>> {
        let i_block = fields.i_block;
        crate::extent::decode(&i_block, |block| self.read_block(block))
    }

    fn lookup_child(&mut self, dir_ino: u32, name: &str) -> Result<(u32, InodeFields)> {
        let fields = self.read_inode(dir_ino)?;
        if fields.mode & 0xF000 != S_IFDIR {
            return Err(Error::NotADirectory(name.to_string()));
        }
        let entries = self.read_dir_entries(&fields)?;
        let entry = entries
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let child_fields = self.read_inode(entry.inode)?;
        Ok((entry.inode, child_fields))
    }

    fn read_symlink_target(&mut self, ino: u32, fields: &InodeFields) -> Result<String> {
        if fields.flags & crate::inode::EXT4_EXTENTS_FL == 0 {
            let len = fields.size as usize;
            return Ok(String::from_utf8_lossy(&fields.i_block[..len]).into_owned());
        }
        let data = self.read_file_bytes(ino, fields, 0, Some(fields.size as usize))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Resolves `path` to its final inode, following symlinks if requested.
    pub fn resolve(&mut self, path: &str, follow_symlinks: bool) -> Result<(u32, InodeFields)> {
        let mut components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_owned)
            .collect();
        components.reverse();

        let mut cur_ino = ROOT_INO;
        let mut cur_fields = self.read_inode(ROOT_INO)?;
        // Directories don't carry on-disk "." / ".." entries (the builder
        // never writes them), so ".." traversal is resolved against this
        // host-side parent stack instead. Root's ".." is itself.
        let mut parents: Vec<(u32, InodeFields)> = Vec::new();
        let mut visited: BTreeSet<u32> = BTreeSet::new();
        let mut depth = 0u32;

        while let Some(component) = components.pop() {
            if component == ".." {
                if let Some((ino, fields)) = parents.pop() {
                    cur_ino = ino;
                    cur_fields = fields;
                }
                continue;
            }

            let (ino, fields) = self.lookup_child(cur_ino, &component)?;

            if follow_symlinks && fields.mode & 0xF000 == S_IFLNK {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH || !visited.insert(ino) {
                    return Err(Error::SymlinkLoop(path.to_string()));
                }
                let target = self.read_symlink_target(ino, &fields)?;
                let mut target_components: Vec<String> = target
                    .split('/')
                    .filter(|c| !c.is_empty() && *c != ".")
                    .map(str::to_owned)
                    .collect();
                if target.starts_with('/') {
                    cur_ino = ROOT_INO;
                    cur_fields = self.read_inode(ROOT_INO)?;
                    parents.clear();
                }
                target_components.reverse();
                components.extend(target_components);
                continue;
            }

            parents.push((cur_ino, cur_fields));
            cur_ino = ino;
            cur_fields = fields;
        }

        Ok((cur_ino, cur_fields))
    }

    pub fn exists(&mut self, path: &str, follow_symlinks: bool) -> bool {
        self.resolve(path, follow_symlinks).is_ok()
    }

    pub fn stat(&mut self, path: &str, follow_symlinks: bool) -> Result<(u32, InodeFields)> {
        self.resolve(path, follow_symlinks)
    }

    pub fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let (_ino, fields) = self.resolve(path, true)?;
        if fields.mode & 0xF000 != S_IFDIR {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let mut names: Vec<String> = self
            .read_dir_entries(&fields)?
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_file_bytes(
        &mut self,
        _ino: u32,
        fields: &InodeFields,
        offset: u64,
        count: Option<usize>,
    ) -> Result<Vec<u8>> {
        let size = fields.size;
        if offset >= size {
            return Ok(Vec::new());
        }
        let want = count.map(|c| c as u64).unwrap_or(size - offset).min(size - offset);
        let extents = self.inode_extents(fields)?;

        let mut out = Vec::with_capacity(want as usize);
        let block_size = u64::from(self.layout.block_size);
        let start = offset;
        let end = offset + want;

        for e in &extents {
            let ext_start = u64::from(e.logical_start) * block_size;
            let ext_end = ext_start + u64::from(e.len) * block_size;
            let overlap_start = start.max(ext_start);
            let overlap_end = end.min(ext_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let mut pos = overlap_start;
            while pos < overlap_end {
                let block_idx = (pos - ext_start) / block_size;
                let physical = e.physical_start + block_idx;
                if physical >= self.layout.total_blocks {
                    return Ok(out);
                }
                let block_off = (pos - ext_start) % block_size;
                let chunk_len = ((overlap_end - pos).min(block_size - block_off))
                    .min(MAX_IO_CHUNK as u64) as usize;

                let block = match self.read_block(physical) {
                    Ok(b) => b,
                    Err(e) => {
                        if out.is_empty() {
                            return Err(e);
                        }
                        return Ok(out);
                    }
                };
                out.extend_from_slice(&block[block_off as usize..block_off as usize + chunk_len]);
                pos += chunk_len as u64;
            }
        }

        out.resize(want as usize, 0);
        Ok(out)
    }

    /// Reads up to `count` bytes (or to EOF, if `None`) starting at `offset`.
    pub fn read_file(
        &mut self,
        path: &str,
        offset: u64,
        count: Option<usize>,
        follow_symlinks: bool,
    ) -> Result<Vec<u8>> {
        let (ino, fields) = self.resolve(path, follow_symlinks)?;
        if fields.mode & 0xF000 == S_IFDIR {
            return Err(Error::IsDirectory(path.to_string()));
        }
        if fields.mode & 0xF000 != S_IFREG {
            return Err(Error::NotAFile(path.to_string()));
        }
        self.read_file_bytes(ino, &fields, offset, count)
    }

    /// Reads into `buf`, returning the number of bytes written (may be less
    /// than `buf.len()` at EOF).
    pub fn read_file_into(&mut self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.read_file(path, offset, Some(buf.len()), true)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}
