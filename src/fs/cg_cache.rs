//! 柱面组缓存
//!
//! 固定数量的槽位, 每个槽位持有一个柱面组描述符的完整缓冲区 (按组号索引, 由缓存独占).
//! `load` 会钉住 (pin) 该组, `release` 解除; 替换时只会挑未被钉住的槽位,
//! 如果所有槽位都被钉住了则说明配置有误 (分配器同时需要的组数不应超过槽位数), 直接报错.
//!
//! 每次载入都会检查组描述符自带的魔数, 不匹配即视为损坏.
//! 修改只把槽位标记为脏, 在替换或 flush 时写回; 卷设置了同步元数据时写回后立即落盘.

use log::{debug, error};

use super::{
    bitmap,
    layout::{cg_off, Csum, CG_MAGIC},
    endian::Codec,
    ufs::MetaIo,
    FsError, FsResult,
};

/// 同时载入内存的柱面组数量上限
pub const MAX_GROUP_LOADED: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CgFormat {
    /// 魔数在第 4 字节, 位图偏移由头部给出
    Modern,
    /// 魔数在第 980 字节, 位图位置固定
    Old,
}

pub struct CylinderGroup {
    pub cgx: u32,
    buf: Vec<u8>,
    codec: Codec,
    format: CgFormat,
    iusedoff: usize,
    freeoff: usize,
    ipg: usize,
    nfrags: usize,
    frag: usize,
    dirty: bool,
}

impl CylinderGroup {
    /// 解析并校验从磁盘读到的描述符
    pub fn parse(cgx: u32, buf: Vec<u8>, io: &MetaIo) -> FsResult<Self> {
        let codec = io.flavor.codec;
        let geo = &io.geo;
        let ipg = geo.ipg as usize;
        let nfrags = geo.fpg as usize;
        let (format, iusedoff, freeoff) = if codec.get_u32(&buf, cg_off::MAGIC) == CG_MAGIC {
            (
                CgFormat::Modern,
                codec.get_u32(&buf, cg_off::IUSEDOFF) as usize,
                codec.get_u32(&buf, cg_off::FREEOFF) as usize,
            )
        } else if buf.len() >= cg_off::OLD_MAGIC + 4
            && codec.get_u32(&buf, cg_off::OLD_MAGIC) == CG_MAGIC
        {
            (CgFormat::Old, cg_off::OLD_IUSED, cg_off::OLD_FREE)
        } else {
            return Err(FsError::corrupted(
                "cylinder group",
                format!("group {}: bad magic number", cgx),
            ));
        };
        let stored_cgx = codec.get_u32(&buf, cg_off::CGX);
        if stored_cgx != cgx {
            return Err(FsError::corrupted(
                "cylinder group",
                format!("group {} claims to be group {}", cgx, stored_cgx),
            ));
        }
        if iusedoff + (ipg + 7) / 8 > buf.len() || freeoff + (nfrags + 7) / 8 > buf.len() {
            return Err(FsError::corrupted(
                "cylinder group",
                format!("group {}: bitmaps extend past the descriptor", cgx),
            ));
        }
        Ok(Self {
            cgx,
            buf,
            codec,
            format,
            iusedoff,
            freeoff,
            ipg,
            nfrags,
            frag: geo.frag as usize,
            dirty: false,
        })
    }

    pub fn format(&self) -> CgFormat {
        self.format
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cs(&self) -> Csum {
        Csum::decode(&self.buf[cg_off::CS..], &self.codec)
    }

    fn add(&mut self, off: usize, delta: i32) -> u32 {
        self.dirty = true;
        self.codec.add_u32(&mut self.buf, off, delta)
    }

    pub fn add_nifree(&mut self, delta: i32) -> u32 {
        self.add(cg_off::CS_NIFREE, delta)
    }

    pub fn add_ndir(&mut self, delta: i32) -> u32 {
        self.add(cg_off::CS_NDIR, delta)
    }

    pub fn add_nbfree(&mut self, delta: i32) -> u32 {
        self.add(cg_off::CS_NBFREE, delta)
    }

    pub fn add_nffree(&mut self, delta: i32) -> u32 {
        self.add(cg_off::CS_NFFREE, delta)
    }

    pub fn irotor(&self) -> u32 {
        self.codec.get_u32(&self.buf, cg_off::IROTOR)
    }

    pub fn set_irotor(&mut self, value: u32) {
        self.dirty = true;
        self.codec.put_u32(&mut self.buf, cg_off::IROTOR, value);
    }

    /// 块轮转指针, 单位是组内块号
    pub fn rotor(&self) -> u32 {
        self.codec.get_u32(&self.buf, cg_off::ROTOR)
    }

    pub fn set_rotor(&mut self, value: u32) {
        self.dirty = true;
        self.codec.put_u32(&mut self.buf, cg_off::ROTOR, value);
    }

    pub fn ipg(&self) -> usize {
        self.ipg
    }

    pub fn nblocks(&self) -> usize {
        self.nfrags / self.frag
    }

    pub fn frag(&self) -> usize {
        self.frag
    }

    pub fn inosused(&self) -> &[u8] {
        &self.buf[self.iusedoff..self.iusedoff + (self.ipg + 7) / 8]
    }

    pub fn inosused_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        let len = (self.ipg + 7) / 8;
        &mut self.buf[self.iusedoff..self.iusedoff + len]
    }

    pub fn blksfree(&self) -> &[u8] {
        &self.buf[self.freeoff..self.freeoff + (self.nfrags + 7) / 8]
    }

    pub fn blksfree_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        let len = (self.nfrags + 7) / 8;
        &mut self.buf[self.freeoff..self.freeoff + len]
    }

    /// 位图中空闲索引节点的个数
    pub fn count_free_inodes(&self) -> usize {
        bitmap::count_zero(self.inosused(), self.ipg)
    }

    /// 位图中整块空闲的块数
    pub fn count_free_blocks(&self) -> usize {
        (0..self.nblocks())
            .filter(|blk| bitmap::isblock(self.blksfree(), self.frag, *blk))
            .count()
    }
}

struct Slot {
    group: CylinderGroup,
    pins: usize,
    last_use: u64,
}

pub struct CgCache {
    slots: Vec<Slot>,
    capacity: usize,
    tick: u64,
}

impl CgCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            tick: 0,
        }
    }

    fn position(&self, cgx: u32) -> Option<usize> {
        self.slots.iter().position(|slot| slot.group.cgx == cgx)
    }

    /// 载入并钉住组 cgx, 返回它所在的槽位
    pub fn load(&mut self, io: &MetaIo, cgx: u32) -> FsResult<usize> {
        if cgx >= io.geo.ncg {
            return Err(FsError::corrupted(
                "cylinder group",
                format!("group {} out of range ({} groups)", cgx, io.geo.ncg),
            ));
        }
        self.tick += 1;
        if let Some(idx) = self.position(cgx) {
            let slot = &mut self.slots[idx];
            slot.pins += 1;
            slot.last_use = self.tick;
            return Ok(idx);
        }
        let buf = io.read_frags(io.geo.cgtod(cgx), io.geo.cgsize as usize)?;
        let group = CylinderGroup::parse(cgx, buf, io).map_err(|e| {
            error!("{}", e);
            e
        })?;
        let slot = Slot {
            group,
            pins: 1,
            last_use: self.tick,
        };
        if self.slots.len() < self.capacity {
            self.slots.push(slot);
            return Ok(self.slots.len() - 1);
        }
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.pins == 0)
            .min_by_key(|(_, slot)| slot.last_use)
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                FsError::Config(format!(
                    "all {} cylinder group slots are pinned",
                    self.capacity
                ))
            })?;
        self.write_back(io, victim)?;
        debug!(
            "cg cache: evict group {} for group {}",
            self.slots[victim].group.cgx, cgx
        );
        self.slots[victim] = slot;
        Ok(victim)
    }

    pub fn release(&mut self, cgx: u32) {
        if let Some(idx) = self.position(cgx) {
            let slot = &mut self.slots[idx];
            slot.pins = slot.pins.saturating_sub(1);
        }
    }

    pub fn group(&self, idx: usize) -> &CylinderGroup {
        &self.slots[idx].group
    }

    pub fn group_mut(&mut self, idx: usize) -> &mut CylinderGroup {
        &mut self.slots[idx].group
    }

    /// 载入 cgx, 在其上执行 f, 无论成功与否都解除钉住
    pub fn with_group<V>(
        &mut self,
        io: &MetaIo,
        cgx: u32,
        f: impl FnOnce(&mut CylinderGroup) -> FsResult<V>,
    ) -> FsResult<V> {
        let idx = self.load(io, cgx)?;
        let result = f(&mut self.slots[idx].group);
        let dirty = self.slots[idx].group.dirty;
        self.release(cgx);
        if dirty && io.synchronous {
            self.write_back(io, idx)?;
        }
        result
    }

    fn write_back(&mut self, io: &MetaIo, idx: usize) -> FsResult<()> {
        let group = &mut self.slots[idx].group;
        if group.dirty {
            io.write_frags(io.geo.cgtod(group.cgx), &group.buf)?;
            group.dirty = false;
        }
        Ok(())
    }

    /// 如果脏了就写回
    pub fn flush(&mut self, io: &MetaIo, cgx: u32) -> FsResult<()> {
        match self.position(cgx) {
            Some(idx) => self.write_back(io, idx),
            None => Ok(()),
        }
    }

    pub fn flush_all(&mut self, io: &MetaIo) -> FsResult<()> {
        for idx in 0..self.slots.len() {
            self.write_back(io, idx)?;
        }
        Ok(())
    }

    pub fn loaded(&self) -> Vec<u32> {
        self.slots.iter().map(|slot| slot.group.cgx).collect()
    }

    pub fn pinned(&self, cgx: u32) -> usize {
        self.position(cgx).map(|idx| self.slots[idx].pins).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mkfs::{scratch_volume, FormatParams};

    #[test]
    fn least_recently_used_groups_are_evicted() {
        let (_dev, fs) = scratch_volume(FormatParams {
            ncg: MAX_GROUP_LOADED as u32 + 4,
            ..FormatParams::default()
        });
        let cgs = fs.cgs.lock();
        let mut loaded = cgs.loaded();
        loaded.sort_unstable();
        assert_eq!(loaded, (4..12).collect::<Vec<u32>>());
        assert!(loaded.iter().all(|cgx| cgs.pinned(*cgx) == 0));
    }

    #[test]
    fn all_slots_pinned_is_a_config_error() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let mut cache = CgCache::new(2);
        let a = cache.load(&fs.io, 0).unwrap();
        let b = cache.load(&fs.io, 1).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.pinned(0), 1);
        assert!(matches!(cache.load(&fs.io, 2), Err(FsError::Config(_))));

        cache.release(1);
        let c = cache.load(&fs.io, 2).unwrap();
        assert_eq!(c, b);
        assert_eq!(cache.group(c).cgx, 2);
        assert!(cache.load(&fs.io, 9).unwrap_err().is_corruption());
    }

    #[test]
    fn dirty_group_is_written_back_on_flush() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let mut cache = CgCache::new(1);
        let idx = cache.load(&fs.io, 1).unwrap();
        let before = cache.group(idx).cs().nifree;
        cache.group_mut(idx).add_nifree(-1);
        assert!(cache.group(idx).is_dirty());
        cache.release(1);
        cache.flush(&fs.io, 1).unwrap();
        assert!(!cache.group(idx).is_dirty());

        let raw = fs
            .io
            .read_frags(fs.io.geo.cgtod(1), fs.io.geo.cgsize as usize)
            .unwrap();
        let reparsed = CylinderGroup::parse(1, raw, &fs.io).unwrap();
        assert_eq!(reparsed.cs().nifree, before - 1);
    }

    #[test]
    fn bad_magic_is_corruption() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let mut raw = fs
            .io
            .read_frags(fs.io.geo.cgtod(3), fs.io.geo.cgsize as usize)
            .unwrap();
        raw[cg_off::MAGIC] ^= 0xff;
        let err = CylinderGroup::parse(3, raw, &fs.io).err().unwrap();
        assert!(err.is_corruption());
    }
}
