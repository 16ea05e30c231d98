//! 柱面组内的位图
//!
//! 每个柱面组有两张位图:
//! - 索引节点位图 (inosused): 每个 bit 代表一个索引节点槽, 1 意味着已经分配出去;
//! - 碎片位图 (blksfree): 每个 bit 代表一个碎片, 注意这里 1 意味着 **空闲**.
//!
//! 位图在柱面组描述符缓冲区里的一段字节上操作, bit i 位于第 i / 8 个字节的第 i % 8 位.

/// 将 bit 编号分解为 (字节下标, 字节内掩码)
fn decomposition(bit: usize) -> (usize, u8) {
    (bit / 8, 1u8 << (bit % 8))
}

pub fn isset(map: &[u8], bit: usize) -> bool {
    let (byte, mask) = decomposition(bit);
    map[byte] & mask != 0
}

pub fn isclr(map: &[u8], bit: usize) -> bool {
    !isset(map, bit)
}

pub fn setbit(map: &mut [u8], bit: usize) {
    let (byte, mask) = decomposition(bit);
    map[byte] |= mask;
}

pub fn clrbit(map: &mut [u8], bit: usize) {
    let (byte, mask) = decomposition(bit);
    map[byte] &= !mask;
}

/// 在 [start, size) 内找第一个为 0 的 bit
///
/// 落在字节边界上且整字节全 1 时一次跳过 8 位, 否则逐位检查.
pub fn find_next_zero(map: &[u8], size: usize, start: usize) -> Option<usize> {
    let mut bit = start;
    while bit < size {
        let (byte, _) = decomposition(bit);
        if bit % 8 == 0 && map[byte] == u8::MAX {
            bit += 8;
            continue;
        }
        if isclr(map, bit) {
            return Some(bit);
        }
        bit += 1;
    }
    None
}

/// [0, size) 内为 0 的 bit 个数
pub fn count_zero(map: &[u8], size: usize) -> usize {
    (0..size).filter(|bit| isclr(map, *bit)).count()
}

/// 以 frag 个 bit 为一组, 第 blk 组是否全部为 1 (即整块空闲)
pub fn isblock(map: &[u8], frag: usize, blk: usize) -> bool {
    (blk * frag..(blk + 1) * frag).all(|bit| isset(map, bit))
}

pub fn setblock(map: &mut [u8], frag: usize, blk: usize) {
    for bit in blk * frag..(blk + 1) * frag {
        setbit(map, bit);
    }
}

pub fn clrblock(map: &mut [u8], frag: usize, blk: usize) {
    for bit in blk * frag..(blk + 1) * frag {
        clrbit(map, bit);
    }
}

/// 从块号 start 开始找一个整块空闲的块, 找不到则回绕到 0 号块
pub fn find_free_block(map: &[u8], frag: usize, nblocks: usize, start: usize) -> Option<usize> {
    let start = if start < nblocks { start } else { 0 };
    (start..nblocks)
        .chain(0..start)
        .find(|blk| isblock(map, frag, *blk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear() {
        let mut map = [0u8; 4];
        setbit(&mut map, 9);
        assert!(isset(&map, 9));
        assert_eq!(map[1], 0b10);
        clrbit(&mut map, 9);
        assert!(isclr(&map, 9));
    }

    #[test]
    fn next_zero_skips_full_bytes() {
        let mut map = [0xffu8, 0xff, 0b0000_0111, 0];
        assert_eq!(find_next_zero(&map, 32, 0), Some(19));
        assert_eq!(find_next_zero(&map, 32, 20), Some(20));
        map[2] = 0xff;
        map[3] = 0xff;
        assert_eq!(find_next_zero(&map, 32, 0), None);
        assert_eq!(find_next_zero(&[0b1011u8], 8, 0), Some(2));
        assert_eq!(count_zero(&[0b1011u8], 4), 1);
    }

    #[test]
    fn whole_blocks() {
        let mut map = [0u8; 2];
        setblock(&mut map, 4, 2);
        assert_eq!(map[1], 0x0f);
        assert!(isblock(&map, 4, 2));
        assert!(!isblock(&map, 4, 1));
        assert_eq!(find_free_block(&map, 4, 4, 3), Some(2));
        clrblock(&mut map, 4, 2);
        assert_eq!(find_free_block(&map, 4, 4, 0), None);
    }
}
