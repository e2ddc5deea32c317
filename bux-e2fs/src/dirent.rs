//! Directory block encoding: a flat, linear run of `ext4_dir_entry_2`
//! records (no HTree index — directories are small enough in practice that
//! linear scan is sufficient, and the Reader never needs the hash index).

use crate::BLOCK_SIZE;

/// One directory entry pending materialization into blocks.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode: u32,
    pub file_type: u8,
}

/// Packs entries into fixed-size blocks, first-fit, extending the last
/// entry of each block to fill it (required by the on-disk format).
pub fn pack_blocks(entries: &[DirEntry]) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut cur = Vec::new();
    let mut used = 0usize;

    for e in entries {
        let rec_len = dirent_len(e.name.len());
        if used + rec_len > BLOCK_SIZE as usize && !cur.is_empty() {
            blocks.push(finish_block(cur, used));
            cur = Vec::new();
            used = 0;
        }
        write_dirent(&mut cur, e.inode, rec_len as u16, &e.name, e.file_type);
        used += rec_len;
    }
    if !cur.is_empty() || blocks.is_empty() {
        blocks.push(finish_block(cur, used));
    }
    blocks
}

fn finish_block(mut buf: Vec<u8>, used: usize) -> Vec<u8> {
    if used == 0 {
        // No real entries: a single unused dirent spanning the whole block,
        // so a rec_len walk never reads past valid data.
        let mut empty = Vec::with_capacity(BLOCK_SIZE as usize);
        write_dirent(&mut empty, 0, BLOCK_SIZE as u16, "", 0);
        empty.resize(BLOCK_SIZE as usize, 0);
        return empty;
    }
    buf.resize(BLOCK_SIZE as usize, 0);
    // Extend the last entry's rec_len to consume the rest of the block.
    if used < BLOCK_SIZE as usize {
        // Walk entries to find the offset of the last one.
        let mut off = 0usize;
        loop {
            let rec_len = u16::from_le_bytes([buf[off + 4], buf[off + 5]]) as usize;
            if off + rec_len >= used {
                let new_len = BLOCK_SIZE as usize - off;
                buf[off + 4..off + 6].copy_from_slice(&(new_len as u16).to_le_bytes());
                break;
            }
            off += rec_len;
        }
    }
    buf
}

fn dirent_len(name_len: usize) -> usize {
    (8 + name_len).div_ceil(4) * 4
}

fn write_dirent(buf: &mut Vec<u8>, inode: u32, rec_len: u16, name: &str, file_type: u8) {
    buf.extend_from_slice(&inode.to_le_bytes());
    buf.extend_from_slice(&rec_len.to_le_bytes());
    buf.push(name.len() as u8);
    buf.push(file_type);
    buf.extend_from_slice(name.as_bytes());
    let pad = rec_len as usize - (8 + name.len());
    buf.extend(std::iter::repeat_n(0u8, pad));
}

/// Parses one directory data block into its entries, in on-disk order.
pub fn parse_block(buf: &[u8]) -> Vec<DirEntry> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + 8 <= buf.len() {
        let inode = u32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes"));
        let rec_len = u16::from_le_bytes(buf[off + 4..off + 6].try_into().expect("2 bytes"));
        if rec_len == 0 {
            break;
        }
        let name_len = buf[off + 6] as usize;
        let file_type = buf[off + 7];
        if inode != 0 && name_len > 0 {
            let name_start = off + 8;
            let name =
                String::from_utf8_lossy(&buf[name_start..name_start + name_len]).into_owned();
            if name != "." && name != ".." {
                out.push(DirEntry {
                    name,
                    inode,
                    file_type,
                });
            }
        }
        off += rec_len as usize;
    }
    out
}
