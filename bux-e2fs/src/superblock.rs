//! Superblock and group descriptor table encoding.

use crate::layout::{EXT4_MAGIC, Layout};

/// `INCOMPAT_FILETYPE | INCOMPAT_EXTENTS` — dirents carry a file-type byte
/// and inodes use extent trees instead of the legacy indirect block map.
const FEATURE_INCOMPAT: u32 = 0x0002 | 0x0040;
/// `RO_COMPAT_LARGE_FILE` — files may exceed 2 GiB.
const FEATURE_RO_COMPAT: u32 = 0x0002;

/// Writes the superblock (1024 bytes, embedded at byte offset 1024 within
/// block 0 or a backup group's first block) into `buf`, which must be at
/// least one block long.
#[allow(clippy::too_many_arguments)]
pub fn write(
    buf: &mut [u8],
    layout: &Layout,
    free_blocks: u64,
    free_inodes: u32,
    used_dirs: u32,
    block_group_nr: u16,
    mkfs_time: u32,
) {
    let sb_off = if block_group_nr == 0 { 1024 } else { 0 };
    let sb = &mut buf[sb_off..sb_off + 1024];

    w32(sb, 0, layout.inodes_per_group as u64 * layout.num_groups as u64 - 0); // placeholder, overwritten below
    w32(sb, 0, total_inodes(layout));
    w32(sb, 4, layout.total_blocks);
    w32(sb, 8, 0); // reserved blocks
    w32(sb, 12, free_blocks);
    w32(sb, 16, u64::from(free_inodes));
    w32(sb, 20, 0); // first data block (block_size > 1024)
    w32(sb, 24, u64::from(layout.block_size.trailing_zeros() - 10)); // log_block_size
    w32(sb, 28, u64::from(layout.block_size.trailing_zeros() - 10)); // log_cluster_size
    w32(sb, 32, u64::from(layout.blocks_per_group));
    w32(sb, 36, u64::from(layout.blocks_per_group));
    w32(sb, 40, u64::from(layout.inodes_per_group));
    w32(sb, 44, u64::from(mkfs_time)); // mtime
    w32(sb, 48, u64::from(mkfs_time)); // wtime
    w16(sb, 52, 0); // mnt_count
    w16(sb, 54, 0xFFFF); // max_mnt_count (disabled)
    w16(sb, 56, EXT4_MAGIC);
    w16(sb, 58, 1); // state: clean
    w16(sb, 60, 1); // errors: continue
    w16(sb, 62, 0); // minor_rev_level
    w32(sb, 64, u64::from(mkfs_time)); // lastcheck
    w32(sb, 68, 0); // checkinterval
    w32(sb, 72, 0); // creator_os: linux
    w32(sb, 76, 1); // rev_level: dynamic
    w16(sb, 80, 0); // def_resuid
    w16(sb, 82, 0); // def_resgid
    w32(sb, 84, u64::from(crate::FIRST_FREE_INO));
    w16(sb, 88, layout.inode_size);
    w16(sb, 90, block_group_nr);
    w32(sb, 92, 0); // feature_compat
    w32(sb, 96, u64::from(FEATURE_INCOMPAT));
    w32(sb, 100, u64::from(FEATURE_RO_COMPAT));
    // s_uuid (104..120) left zeroed; s_volume_name (120..136) left zeroed.
    w32(sb, 204, 0); // prealloc_blocks / prealloc_dir_blocks share this word, left 0
    w16(sb, 206, 0); // reserved_gdt_blocks
    w32(sb, 224, 0); // journal_inum: none
    w16(sb, 254, 0); // desc_size: 32 (non-64bit)
    w32(sb, 264, u64::from(mkfs_time)); // mkfs_time
}

fn total_inodes(layout: &Layout) -> u64 {
    u64::from(layout.inodes_per_group) * u64::from(layout.num_groups)
}

fn w16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn w32(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 4].copy_from_slice(&(v as u32).to_le_bytes());
}

/// Writes one 32-byte group descriptor entry.
pub fn write_group_desc(
    buf: &mut [u8],
    layout: &Layout,
    g: u32,
    free_blocks: u16,
    free_inodes: u16,
    used_dirs: u16,
) {
    let off = g as usize * 32;
    let gd = &mut buf[off..off + 32];
    w32(gd, 0, layout.block_bitmap(g));
    w32(gd, 4, layout.inode_bitmap(g));
    w32(gd, 8, layout.inode_table(g));
    w16(gd, 12, free_blocks);
    w16(gd, 14, free_inodes);
    w16(gd, 16, used_dirs);
    w16(gd, 18, 0); // flags
}

/// Reads the fields this crate needs back out of a superblock buffer
/// (expects the 1024-byte superblock starting at `buf[0]`).
#[derive(Debug, Clone, Copy)]
pub struct SuperblockInfo {
    pub inodes_per_group: u32,
    pub blocks_per_group: u32,
    pub inode_size: u16,
    pub total_blocks: u64,
    pub num_groups: u32,
}

pub fn read(buf: &[u8]) -> crate::Result<SuperblockInfo> {
    let magic = u16::from_le_bytes(buf[56..58].try_into().expect("2 bytes"));
    if magic != EXT4_MAGIC {
        return Err(crate::Error::BadMagic);
    }
    let total_blocks = u64::from(u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")));
    let blocks_per_group =
        u32::from_le_bytes(buf[32..36].try_into().expect("4 bytes"));
    let inodes_per_group =
        u32::from_le_bytes(buf[40..44].try_into().expect("4 bytes"));
    let inode_size = u16::from_le_bytes(buf[88..90].try_into().expect("2 bytes"));
    let num_groups = total_blocks.div_ceil(u64::from(blocks_per_group)) as u32;

    Ok(SuperblockInfo {
        inodes_per_group,
        blocks_per_group,
        inode_size,
        total_blocks,
        num_groups,
    })
}

pub fn group_desc_location(gd: &[u8], g: u32) -> (u64, u64, u64) {
    let off = g as usize * 32;
    let block_bitmap = u64::from(u32::from_le_bytes(
        gd[off..off + 4].try_into().expect("4 bytes"),
    ));
    let inode_bitmap = u64::from(u32::from_le_bytes(
        gd[off + 4..off + 8].try_into().expect("4 bytes"),
    ));
    let inode_table = u64::from(u32::from_le_bytes(
        gd[off + 8..off + 12].try_into().expect("4 bytes"),
    ));
    (block_bitmap, inode_bitmap, inode_table)
}
