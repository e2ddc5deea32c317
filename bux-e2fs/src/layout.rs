//! Block group layout and the bump allocator over the data region.

use crate::{BLOCK_SIZE, Result};

/// ext4 magic number (`s_magic`).
pub const EXT4_MAGIC: u16 = 0xEF53;
/// Standard (non-64bit) group descriptor size in bytes.
pub const GDT_ENTRY_SIZE: u32 = 32;
/// Blocks mapped by a single block/inode bitmap: `8 * block_size` bits.
pub const BLOCKS_PER_GROUP: u32 = 8 * BLOCK_SIZE;

/// Fixed geometry derived once from the requested image size.
///
/// No `sparse_super` feature is set, so every group carries a backup
/// superblock and group descriptor table — simpler than computing the
/// sparse backup group sequence, at the cost of a little wasted space.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub block_size: u32,
    pub total_blocks: u64,
    pub blocks_per_group: u32,
    pub num_groups: u32,
    pub gdt_blocks: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub itable_blocks: u32,
    /// Blocks consumed by metadata at the start of every group (superblock
    /// or its backup, GDT or its backup, block bitmap, inode bitmap, inode
    /// table).
    pub overhead_blocks: u32,
}

impl Layout {
    /// Computes the on-disk layout for an image of `total_blocks` blocks
    /// able to hold at least `min_inodes` inodes.
    pub fn new(total_blocks: u64, min_inodes: u32) -> Result<Self> {
        let blocks_per_group = BLOCKS_PER_GROUP;
        let num_groups = total_blocks.div_ceil(u64::from(blocks_per_group)) as u32;
        let gdt_blocks = (num_groups * GDT_ENTRY_SIZE).div_ceil(BLOCK_SIZE);

        let inode_size: u16 = 256;
        let inodes_per_group = min_inodes.div_ceil(num_groups).max(32);
        let itable_bytes = u64::from(inodes_per_group) * u64::from(inode_size);
        let itable_blocks = itable_bytes.div_ceil(u64::from(BLOCK_SIZE)) as u32;

        // superblock(1) + gdt + block bitmap(1) + inode bitmap(1) + inode table.
        let overhead_blocks = 1 + gdt_blocks + 1 + 1 + itable_blocks;

        if u64::from(overhead_blocks) * u64::from(num_groups) >= total_blocks {
            return Err(crate::Error::TooSmall);
        }

        Ok(Self {
            block_size: BLOCK_SIZE,
            total_blocks,
            blocks_per_group,
            num_groups,
            gdt_blocks,
            inodes_per_group,
            inode_size,
            itable_blocks,
            overhead_blocks,
        })
    }

    /// First block belonging to group `g`.
    pub const fn group_start(&self, g: u32) -> u64 {
        u64::from(g) * u64::from(self.blocks_per_group)
    }

    /// One-past-the-last block belonging to group `g`.
    pub fn group_end(&self, g: u32) -> u64 {
        (self.group_start(g) + u64::from(self.blocks_per_group)).min(self.total_blocks)
    }

    /// First data block (after fixed metadata) of group `g`.
    pub const fn group_data_start(&self, g: u32) -> u64 {
        self.group_start(g) + u64::from(self.overhead_blocks)
    }

    /// Block bitmap block number for group `g`.
    pub const fn block_bitmap(&self, g: u32) -> u64 {
        self.group_start(g) + 1 + self.gdt_blocks as u64
    }

    /// Inode bitmap block number for group `g`.
    pub const fn inode_bitmap(&self, g: u32) -> u64 {
        self.block_bitmap(g) + 1
    }

    /// First block of the inode table for group `g`.
    pub const fn inode_table(&self, g: u32) -> u64 {
        self.inode_bitmap(g) + 1
    }

    /// Group a given physical block belongs to.
    pub fn block_to_group(&self, block: u64) -> u32 {
        (block / u64::from(self.blocks_per_group)) as u32
    }

    /// Resolves the `(inode_table_block, byte_offset)` location of `ino`.
    pub fn inode_location(&self, ino: u32) -> (u64, u64) {
        let idx = ino - 1;
        let group = idx / self.inodes_per_group;
        let local = idx % self.inodes_per_group;
        let byte = u64::from(local) * u64::from(self.inode_size);
        let block = self.inode_table(group) + byte / u64::from(self.block_size);
        (block, byte % u64::from(self.block_size))
    }
}

/// Bump allocator over the data region of every group.
///
/// Allocations never straddle a group's metadata overhead: a request that
/// would cross into the next group's overhead region skips ahead to that
/// group's data start instead, wasting the tail of the current group. This
/// matches a plain bump allocator with no fragmentation recovery.
#[derive(Debug)]
pub struct BlockAllocator<'a> {
    layout: &'a Layout,
    cursor: u64,
}

impl<'a> BlockAllocator<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self {
            layout,
            cursor: layout.group_data_start(0),
        }
    }

    /// Allocates `n` contiguous blocks, returning the first block number.
    pub fn alloc_run(&mut self, n: u64) -> Result<u64> {
        loop {
            let g = self.layout.block_to_group(self.cursor);
            let end = self.layout.group_end(g);
            if self.cursor + n <= end {
                let start = self.cursor;
                self.cursor += n;
                return Ok(start);
            }
            if g + 1 >= self.layout.num_groups {
                return Err(crate::Error::OutOfSpace);
            }
            self.cursor = self.layout.group_data_start(g + 1);
        }
    }

    /// Total blocks handed out so far (used to populate free-block counts).
    pub fn used_blocks(&self) -> u64 {
        self.cursor - self.layout.group_data_start(0)
    }
}
