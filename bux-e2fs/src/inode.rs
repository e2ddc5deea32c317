//! Inode encoding: mode/uid/gid/size/timestamps plus the `i_block` area
//! (fast-symlink target or extent tree, see [`crate::extent`]).

pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFLNK: u16 = 0xA000;

/// `EXT4_EXTENTS_FL` — this inode's `i_block` holds an extent tree rather
/// than raw data or the legacy indirect block map.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;

/// In-memory view of the fields this crate populates; the remaining bytes
/// of the 256-byte on-disk inode are left zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeFields {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub blocks_512: u32,
    pub flags: u32,
    pub mtime: u32,
    pub i_block: [u8; 60],
}

/// Writes one inode's fields into its 256-byte on-disk slot.
pub fn write(buf: &mut [u8], f: &InodeFields) {
    debug_assert!(buf.len() >= 160);
    buf[0..2].copy_from_slice(&f.mode.to_le_bytes());
    buf[2..4].copy_from_slice(&(f.uid as u16).to_le_bytes());
    buf[4..8].copy_from_slice(&(f.size as u32).to_le_bytes());
    buf[8..12].copy_from_slice(&f.mtime.to_le_bytes()); // atime
    buf[12..16].copy_from_slice(&f.mtime.to_le_bytes()); // ctime
    buf[16..20].copy_from_slice(&f.mtime.to_le_bytes()); // mtime
    buf[20..24].copy_from_slice(&0u32.to_le_bytes()); // dtime
    buf[24..26].copy_from_slice(&(f.gid as u16).to_le_bytes());
    buf[26..28].copy_from_slice(&f.links_count.to_le_bytes());
    buf[28..32].copy_from_slice(&f.blocks_512.to_le_bytes());
    buf[32..36].copy_from_slice(&f.flags.to_le_bytes());
    buf[40..100].copy_from_slice(&f.i_block);
    buf[108..112].copy_from_slice(&((f.size >> 32) as u32).to_le_bytes());
    // i_uid_high / i_gid_high in osd2, bytes 120..124.
    buf[120..122].copy_from_slice(&((f.uid >> 16) as u16).to_le_bytes());
    buf[122..124].copy_from_slice(&((f.gid >> 16) as u16).to_le_bytes());
    if buf.len() > 128 {
        buf[128..130].copy_from_slice(&32u16.to_le_bytes()); // i_extra_isize
    }
}

/// Reads the fields this crate needs out of a 256-byte on-disk inode slot.
pub fn read(buf: &[u8]) -> InodeFields {
    let mode = u16::from_le_bytes(buf[0..2].try_into().expect("2 bytes"));
    let uid_lo = u16::from_le_bytes(buf[2..4].try_into().expect("2 bytes"));
    let size_lo = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes"));
    let mtime = u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes"));
    let gid_lo = u16::from_le_bytes(buf[24..26].try_into().expect("2 bytes"));
    let links_count = u16::from_le_bytes(buf[26..28].try_into().expect("2 bytes"));
    let blocks_512 = u32::from_le_bytes(buf[28..32].try_into().expect("4 bytes"));
    let flags = u32::from_le_bytes(buf[32..36].try_into().expect("4 bytes"));
    let mut i_block = [0u8; 60];
    i_block.copy_from_slice(&buf[40..100]);
    let size_hi = u32::from_le_bytes(buf[108..112].try_into().expect("4 bytes"));
    let uid_hi = if buf.len() > 122 {
        u16::from_le_bytes(buf[120..122].try_into().expect("2 bytes"))
    } else {
        0
    };
    let gid_hi = if buf.len() > 124 {
        u16::from_le_bytes(buf[122..124].try_into().expect("2 bytes"))
    } else {
        0
    };

    InodeFields {
        mode,
        uid: (u32::from(uid_hi) << 16) | u32::from(uid_lo),
        gid: (u32::from(gid_hi) << 16) | u32::from(gid_lo),
        size: (u64::from(size_hi) << 32) | u64::from(size_lo),
        links_count,
        blocks_512,
        flags,
        mtime,
        i_block,
    }
}

pub const fn file_type(mode: u16) -> u8 {
    match mode & 0xF000 {
        S_IFDIR => 2,
        S_IFLNK => 7,
        _ => 1,
    }
}
