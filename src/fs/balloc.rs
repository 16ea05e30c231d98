//! 数据块分配器
//!
//! 目录只会以整块为单位增长, 所以这里只分配整块. 回收时还要能处理别的实现留下的文件尾部碎片.
//! 选组顺序与索引节点分配相同, 组内从块轮转指针开始在 blksfree 位图里找整块空闲的块.

use log::debug;

use super::{bitmap, ialloc::group_search_order, ufs::UfsFileSystem, FsError, FsResult};

impl UfsFileSystem {
    /// 分配一个清零的整块, 返回它的碎片地址
    pub fn alloc_block(&self, hint_cg: u32) -> FsResult<u32> {
        self.ensure_writable()?;
        let geo = &self.io.geo;
        let mut cgs = self.cgs.lock();
        let cgx = {
            let vol = self.volume.lock();
            group_search_order(hint_cg, geo.ncg).find(|c| vol.csum[*c as usize].nbfree > 0)
        }
        .ok_or(FsError::NoSpace)?;
        let dblkno = geo.dblkno as usize;
        let blk = cgs.with_group(&self.io, cgx, |cg| {
            let frag = cg.frag();
            let blk = bitmap::find_free_block(cg.blksfree(), frag, cg.nblocks(), cg.rotor() as usize)
                .ok_or_else(|| {
                    FsError::corrupted(
                        "cylinder group",
                        format!("group {}: summary says free blocks but bitmap has none", cgx),
                    )
                })?;
            if blk * frag < dblkno {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!("group {}: metadata block {} marked free", cgx, blk),
                ));
            }
            bitmap::clrblock(cg.blksfree_mut(), frag, blk);
            cg.set_rotor(blk as u32);
            cg.add_nbfree(-1);
            Ok(blk as u32)
        })?;
        self.volume.lock().adjust(cgx, |cs| cs.nbfree -= 1);
        drop(cgs);

        let addr = geo.cgbase(cgx) + geo.blkstofrags(blk);
        self.io.write_frags(addr, &vec![0u8; geo.bsize as usize])?;
        debug!("balloc: block at frag {} in group {}", addr, cgx);
        Ok(addr)
    }

    pub fn free_block(&self, addr: u32) -> FsResult<()> {
        self.ensure_writable()?;
        let geo = &self.io.geo;
        let cgx = geo.dtog(addr);
        let off = geo.dtogd(addr);
        if cgx >= geo.ncg || off % geo.frag != 0 || off < geo.dblkno {
            return Err(FsError::corrupted(
                "block",
                format!("freeing bad block address {}", addr),
            ));
        }
        let blk = geo.fragstoblks(off) as usize;
        let mut cgs = self.cgs.lock();
        cgs.with_group(&self.io, cgx, |cg| {
            let frag = cg.frag();
            if (blk * frag..(blk + 1) * frag).any(|bit| bitmap::isset(cg.blksfree(), bit)) {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!("freeing free block at frag {}", addr),
                ));
            }
            bitmap::setblock(cg.blksfree_mut(), frag, blk);
            cg.add_nbfree(1);
            Ok(())
        })?;
        self.volume.lock().adjust(cgx, |cs| cs.nbfree += 1);
        debug!("bfree: block at frag {}", addr);
        Ok(())
    }

    /// 释放一个块内的 count 个碎片 (文件尾部), 凑满整块时折算成一个空闲块
    pub fn free_frags(&self, addr: u32, count: u32) -> FsResult<()> {
        self.ensure_writable()?;
        let geo = &self.io.geo;
        if count == geo.frag {
            return self.free_block(addr);
        }
        let cgx = geo.dtog(addr);
        let off = geo.dtogd(addr);
        if cgx >= geo.ncg || count == 0 || off % geo.frag + count > geo.frag || off < geo.dblkno {
            return Err(FsError::corrupted(
                "block",
                format!("freeing bad fragment range {}+{}", addr, count),
            ));
        }
        let mut cgs = self.cgs.lock();
        let whole = cgs.with_group(&self.io, cgx, |cg| {
            let frag = cg.frag();
            let first = off as usize;
            let range = first..first + count as usize;
            if range.clone().any(|bit| bitmap::isset(cg.blksfree(), bit)) {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!("freeing free fragment at {}", addr),
                ));
            }
            for bit in range {
                bitmap::setbit(cg.blksfree_mut(), bit);
            }
            cg.add_nffree(count as i32);
            let blk = first / frag;
            if bitmap::isblock(cg.blksfree(), frag, blk) {
                cg.add_nffree(-(frag as i32));
                cg.add_nbfree(1);
                return Ok(true);
            }
            Ok(false)
        })?;
        let frag = geo.frag;
        self.volume.lock().adjust(cgx, |cs| {
            cs.nffree += count;
            if whole {
                cs.nffree -= frag;
                cs.nbfree += 1;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::mkfs::{scratch_volume, FormatParams};
    use crate::fs::FsError;

    #[test]
    fn blocks_come_from_the_hint_group_and_return() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let geo = fs.geometry().clone();
        let total = fs.totals();
        let addr = fs.alloc_block(1).unwrap();
        assert_eq!(geo.dtog(addr), 1);
        assert_eq!(addr % geo.frag, 0);
        assert!(geo.dtogd(addr) >= geo.dblkno);
        assert_eq!(fs.totals().nbfree, total.nbfree - 1);
        fs.audit_counters().unwrap();
        fs.free_block(addr).unwrap();
        assert_eq!(fs.totals(), total);
        assert!(fs.free_block(addr).unwrap_err().is_corruption());
    }

    #[test]
    fn fragment_double_free_is_corruption() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let total = fs.totals();
        let addr = fs.alloc_block(0).unwrap();
        fs.free_frags(addr, 1).unwrap();
        assert_eq!(fs.totals().nffree, total.nffree + 1);
        assert!(fs.free_frags(addr, 1).unwrap_err().is_corruption());
    }

    #[test]
    fn fragment_tail_completes_whole_block() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let total = fs.totals();
        let frag = fs.geometry().frag;
        let addr = fs.alloc_block(0).unwrap();
        fs.free_frags(addr, 1).unwrap();
        fs.free_frags(addr + 1, frag - 1).unwrap();
        assert_eq!(fs.totals(), total);
    }

    #[test]
    fn metadata_addresses_cannot_be_freed() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let geo = fs.geometry().clone();
        assert!(fs.free_block(geo.cgtod(0)).unwrap_err().is_corruption());
        assert!(fs.free_block(geo.size + geo.fpg).unwrap_err().is_corruption());
    }

    #[test]
    fn running_dry_is_no_space() {
        let (_dev, fs) = scratch_volume(FormatParams {
            ncg: 1,
            ..FormatParams::default()
        });
        let free = fs.totals().nbfree;
        for _ in 0..free {
            fs.alloc_block(0).unwrap();
        }
        assert!(matches!(fs.alloc_block(0), Err(FsError::NoSpace)));
        fs.audit_counters().unwrap();
    }
}
