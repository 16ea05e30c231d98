//! 索引节点分配器
//!
//! 选组顺序: 先试提示组 (通常是父目录所在的组), 再用二次探测, 最后线性扫描剩下的组.
//! 选组只看汇总区里的空闲计数; 组内按 inosused 位图从 irotor 开始找, 到尾部后回绕.
//! 汇总说有空闲而位图里找不到, 说明两者不一致, 作为损坏报告.
//!
//! 每次分配/释放都同时更新三层计数: 柱面组头部, 汇总区, 超级块总计.

use log::{debug, error, warn};
use rand::Rng;

use super::{
    bitmap,
    inode::InodeKind,
    layout::DiskInode,
    ufs::{now, UfsFileSystem},
    FsError, FsResult,
};

/// 组的探查顺序: 提示组, 二次探测, 线性扫描
///
/// 同一个组可能出现多次, 但 [0, ncg) 中的每个组至少出现一次.
pub fn group_search_order(hint: u32, ncg: u32) -> impl Iterator<Item = u32> {
    let hint = hint % ncg;
    let mut quadratic = Vec::new();
    let mut i = hint;
    let mut j = 1;
    while j < ncg {
        i += j;
        if i >= ncg {
            i -= ncg;
        }
        quadratic.push(i);
        j <<= 1;
    }
    let linear = (2..ncg).map(move |step| (hint + step) % ncg);
    std::iter::once(hint).chain(quadratic).chain(linear)
}

impl UfsFileSystem {
    /// 分配一个索引节点并写入初始内容, 返回索引节点号
    ///
    /// 新节点的链接数为 0, 由调用者在目录项插入成功后设置.
    pub fn alloc_inode(&self, hint_ino: u32, kind: InodeKind, perm: u16) -> FsResult<u32> {
        self.ensure_writable()?;
        let geo = &self.io.geo;
        let is_dir = kind.is_dir();
        let mut cgs = self.cgs.lock();
        let cgx = {
            let vol = self.volume.lock();
            group_search_order(geo.ino_to_cg(hint_ino), geo.ncg)
                .find(|c| vol.csum[*c as usize].nifree > 0)
        }
        .ok_or(FsError::NoSpace)?;

        let bit = cgs.with_group(&self.io, cgx, |cg| {
            let ipg = cg.ipg();
            let start = cg.irotor() as usize;
            let start = if start < ipg { start } else { 0 };
            let bit = bitmap::find_next_zero(cg.inosused(), ipg, start)
                .or_else(|| bitmap::find_next_zero(cg.inosused(), start, 0))
                .ok_or_else(|| {
                    FsError::corrupted(
                        "cylinder group",
                        format!("group {}: summary says free inodes but bitmap is full", cgx),
                    )
                })?;
            if cgx == 0 && bit < 2 {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!("reserved inode {} marked free", bit),
                ));
            }
            bitmap::setbit(cg.inosused_mut(), bit);
            cg.set_irotor(bit as u32);
            cg.add_nifree(-1);
            if is_dir {
                cg.add_ndir(1);
            }
            Ok(bit as u32)
        })?;
        self.volume.lock().adjust(cgx, |cs| {
            cs.nifree -= 1;
            if is_dir {
                cs.ndir += 1;
            }
        });
        drop(cgs);

        let ino = cgx * geo.ipg + bit;
        let t = now();
        let inode = DiskInode {
            mode: kind.mode_bits() | (perm & 0o7777),
            atime: t,
            mtime: t,
            ctime: t,
            gen: rand::thread_rng().gen(),
            ..DiskInode::default()
        };
        if let Err(e) = self.write_inode(ino, &inode) {
            // 位图和计数已经提交, 写不进去就还回去
            if let Err(undo) = self.free_inode(ino, is_dir) {
                warn!("ialloc: cannot release inode {} after failed write: {}", ino, undo);
            }
            return Err(e);
        }
        debug!("ialloc: inode {} in group {} ({:?})", ino, cgx, kind);
        Ok(ino)
    }

    /// 把 ino 还回位图, 调用者保证磁盘上的节点已经不再被引用
    pub fn free_inode(&self, ino: u32, is_dir: bool) -> FsResult<()> {
        self.ensure_writable()?;
        let geo = &self.io.geo;
        if ino <= 1 || ino >= geo.max_inodes() {
            error!("ifree: reserved or nonexistent inode {}", ino);
            return Err(FsError::corrupted(
                "inode",
                format!("freeing reserved or nonexistent inode {}", ino),
            ));
        }
        let cgx = geo.ino_to_cg(ino);
        let bit = geo.ino_to_cgoff(ino) as usize;
        let mut cgs = self.cgs.lock();
        cgs.with_group(&self.io, cgx, |cg| {
            if bitmap::isclr(cg.inosused(), bit) {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!("bit already cleared for inode {}", ino),
                ));
            }
            bitmap::clrbit(cg.inosused_mut(), bit);
            if (bit as u32) < cg.irotor() {
                cg.set_irotor(bit as u32);
            }
            cg.add_nifree(1);
            if is_dir {
                cg.add_ndir(-1);
            }
            Ok(())
        })?;
        self.volume.lock().adjust(cgx, |cs| {
            cs.nifree += 1;
            if is_dir {
                cs.ndir -= 1;
            }
        });
        debug!("ifree: inode {}", ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mkfs::{scratch_volume, FormatParams};
    use std::collections::HashSet;

    #[test]
    fn search_order_visits_every_group() {
        for ncg in 1..40 {
            for hint in 0..ncg {
                let seen: HashSet<u32> = group_search_order(hint, ncg).collect();
                assert_eq!(seen.len() as u32, ncg, "ncg {} hint {}", ncg, hint);
            }
        }
        let order: Vec<u32> = group_search_order(3, 8).take(4).collect();
        assert_eq!(order, vec![3, 4, 6, 2]);
    }

    #[test]
    fn allocation_prefers_hint_group_and_updates_counters() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let ipg = fs.geometry().ipg;
        let before = fs.group_summary(2);
        let total = fs.totals();
        let ino = fs.alloc_inode(2 * ipg + 5, InodeKind::Directory, 0o755).unwrap();
        assert_eq!(fs.geometry().ino_to_cg(ino), 2);
        let after = fs.group_summary(2);
        assert_eq!(after.nifree, before.nifree - 1);
        assert_eq!(after.ndir, before.ndir + 1);
        assert_eq!(fs.totals().nifree, total.nifree - 1);
        assert_eq!(fs.inode_kind(ino).unwrap(), InodeKind::Directory);
        fs.audit_counters().unwrap();

        fs.free_inode(ino, true).unwrap();
        assert_eq!(fs.group_summary(2), before);
        assert_eq!(fs.totals(), total);
        fs.audit_counters().unwrap();
    }

    #[test]
    fn freed_slot_pulls_rotor_back() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let a = fs.alloc_inode(2, InodeKind::File, 0o644).unwrap();
        let b = fs.alloc_inode(2, InodeKind::File, 0o644).unwrap();
        assert_eq!(b, a + 1);
        fs.free_inode(a, false).unwrap();
        assert_eq!(fs.alloc_inode(2, InodeKind::File, 0o644).unwrap(), a);
    }

    #[test]
    fn double_free_and_reserved_numbers_are_corruption() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let ino = fs.alloc_inode(2, InodeKind::File, 0o644).unwrap();
        fs.free_inode(ino, false).unwrap();
        assert!(fs.free_inode(ino, false).unwrap_err().is_corruption());
        assert!(fs.free_inode(1, false).unwrap_err().is_corruption());
        let max = fs.geometry().max_inodes();
        assert!(fs.free_inode(max, false).unwrap_err().is_corruption());
    }

    #[test]
    fn exhaustion_reports_no_space_without_touching_bitmaps() {
        let (_dev, fs) = scratch_volume(FormatParams {
            ncg: 2,
            ..FormatParams::default()
        });
        let mut seen = HashSet::new();
        loop {
            match fs.alloc_inode(2, InodeKind::File, 0o644) {
                Ok(ino) => assert!(seen.insert(ino)),
                Err(FsError::NoSpace) => break,
                Err(e) => panic!("unexpected {}", e),
            }
        }
        // 2 个组, 每组 ipg 个, 减去 0, 1, 2 号
        assert_eq!(seen.len() as u32, 2 * fs.geometry().ipg - 3);
        assert_eq!(fs.totals().nifree, 0);
        let maps: Vec<Vec<u8>> = {
            let mut cgs = fs.cgs.lock();
            (0..2)
                .map(|c| cgs.with_group(&fs.io, c, |cg| Ok(cg.inosused().to_vec())).unwrap())
                .collect()
        };
        assert!(matches!(
            fs.alloc_inode(2, InodeKind::File, 0o644),
            Err(FsError::NoSpace)
        ));
        let mut cgs = fs.cgs.lock();
        for c in 0..2 {
            let now = cgs.with_group(&fs.io, c, |cg| Ok(cg.inosused().to_vec())).unwrap();
            assert_eq!(now, maps[c as usize]);
        }
    }

    #[test]
    fn summary_bitmap_disagreement_is_corruption() {
        let (_dev, fs) = scratch_volume(FormatParams {
            ncg: 1,
            ..FormatParams::default()
        });
        while fs.alloc_inode(2, InodeKind::File, 0o644).is_ok() {}
        fs.volume.lock().csum[0].nifree = 1;
        let err = fs.alloc_inode(2, InodeKind::File, 0o644).unwrap_err();
        assert!(err.is_corruption());
    }
}
