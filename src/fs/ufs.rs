//! 卷: 把试探结果, 几何参数, 块缓存, 柱面组缓存和锁表组织在一起
//!
//! [`UfsFileSystem`] 知道每个布局区域所在的位置, 索引节点和数据块的分配/回收都要经过它,
//! 因此某种意义上讲它可以看成一个磁盘块管理器.
//!
//! 锁的顺序 (外层到内层): 目录/索引节点锁 -> 柱面组缓存锁 -> 卷状态锁 -> 块缓存.
//! 分配器持有柱面组缓存锁期间才会短暂地拿卷状态锁, 反过来则不允许.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use spin::Mutex;

use super::{
    cg_cache::{CgCache, MAX_GROUP_LOADED},
    dialect::{Dialect, Flavor, SBLOCK_OFFSET},
    geometry::Geometry,
    layout::{Csum, SuperBlock, CSUM_SIZE, FSOK, FS_BAD, FS_CLEAN, FS_LOG, FS_OSF1, FS_STABLE},
    locks::InodeLocks,
    probe::{self, state_offset, ProbeOutcome},
    BlockCacheManager, BlockDevice, FsError, FsResult, BLOCK_CACHE_SIZE,
};

/// 挂载选项
#[derive(Clone, Copy, Debug, Default)]
pub struct MountOptions {
    /// 不指定则自动试探
    pub dialect: Option<Dialect>,
    pub read_only: bool,
    /// 每次元数据修改后立即写回磁盘
    pub synchronous: bool,
}

/// 元数据读写的通道: 块缓存 + 不可变的方言/几何配置
pub struct MetaIo {
    pub cache: BlockCacheManager,
    pub flavor: Flavor,
    pub geo: Geometry,
    pub synchronous: bool,
}

impl MetaIo {
    /// 从碎片地址 frag 开始读 len 个字节
    pub fn read_frags(&self, frag: u32, len: usize) -> FsResult<Vec<u8>> {
        self.cache.read_bytes(frag as usize, len)
    }

    pub fn write_frags(&self, frag: u32, data: &[u8]) -> FsResult<()> {
        self.cache.write_bytes(frag as usize, data)?;
        if self.synchronous {
            let fsize = self.geo.fsize as usize;
            for i in 0..(data.len() + fsize - 1) / fsize {
                self.cache.sync_block(frag as usize + i)?;
            }
        }
        Ok(())
    }

    /// 同步模式下把刚改过的一个碎片写回
    pub fn settle(&self, frag: u32) -> FsResult<()> {
        if self.synchronous {
            self.cache.sync_block(frag as usize)?;
        }
        Ok(())
    }
}

/// 受卷锁保护的可变状态
pub struct VolumeState {
    pub sb: SuperBlock,
    /// 柱面汇总区, 每组一项
    pub csum: Vec<Csum>,
    pub read_only: bool,
    /// 超级块/汇总区在内存中被改过
    pub dirty: bool,
}

impl VolumeState {
    pub fn adjust(&mut self, cgx: u32, f: impl Fn(&mut Csum)) {
        f(&mut self.csum[cgx as usize]);
        f(&mut self.sb.cstotal);
        self.dirty = true;
    }
}

pub struct UfsFileSystem {
    pub(crate) io: MetaIo,
    pub(crate) volume: Mutex<VolumeState>,
    pub(crate) cgs: Mutex<CgCache>,
    pub(crate) locks: InodeLocks,
    /// 跨目录 rename 互斥, 保证祖先检查期间目录树的形状不变
    pub(crate) rename_lock: Mutex<()>,
    base_bytes: usize,
    rereads: u32,
}

fn is_clean(flavor: &Flavor, sb: &SuperBlock) -> bool {
    let clean_byte = matches!(sb.clean, FS_CLEAN | FS_STABLE | FS_OSF1 | FS_LOG);
    match state_offset(flavor.dialect) {
        Some(_) => clean_byte && sb.state == FSOK.wrapping_sub(sb.time),
        None => clean_byte,
    }
}

pub fn now() -> u32 {
    Utc::now().timestamp() as u32
}

impl UfsFileSystem {
    /// 试探超级块, 建立几何参数, 载入汇总区并校验每个柱面组
    pub fn mount(device: Arc<dyn BlockDevice>, opts: MountOptions) -> FsResult<Arc<Self>> {
        let ProbeOutcome {
            flavor,
            sb,
            base_bytes,
            block_size,
            rereads,
        } = probe::probe(&device, opts.dialect)?;
        let geo = Geometry::from_superblock(&sb)?;
        info!(
            "mount: dialect {} ({} endian), {} groups of {} frags, bsize {} fsize {}",
            flavor.dialect.spec().name,
            flavor.order().name(),
            geo.ncg,
            geo.fpg,
            geo.bsize,
            geo.fsize
        );

        let mut read_only = opts.read_only;
        if flavor.dialect.spec().read_only && !read_only {
            warn!(
                "ufstype={} is supported read-only, mounting read-only",
                flavor.dialect.spec().name
            );
            read_only = true;
        }
        if !is_clean(&flavor, &sb) && !read_only {
            warn!("fs is not clean (clean byte {:#x}), mounting read-only", sb.clean);
            read_only = true;
        }

        let io = MetaIo {
            cache: BlockCacheManager::new(device, block_size, base_bytes / block_size, BLOCK_CACHE_SIZE),
            flavor,
            geo,
            synchronous: opts.synchronous,
        };

        let cs_bytes = io.read_frags(io.geo.csaddr, io.geo.cssize as usize)?;
        let csum = (0..io.geo.ncg as usize)
            .map(|c| Csum::decode(&cs_bytes[c * CSUM_SIZE..], &flavor.codec))
            .collect();

        let fs = Self {
            io,
            volume: Mutex::new(VolumeState {
                sb,
                csum,
                read_only,
                dirty: false,
            }),
            cgs: Mutex::new(CgCache::new(MAX_GROUP_LOADED)),
            locks: InodeLocks::new(),
            rename_lock: Mutex::new(()),
            base_bytes,
            rereads,
        };
        // 组描述符损坏时先标记为坏, 随后的 drop 就不会把卷写成干净
        let loaded = {
            let mut cgs = fs.cgs.lock();
            (0..fs.io.geo.ncg).try_for_each(|cgx| cgs.with_group(&fs.io, cgx, |_| Ok(())))
        };
        fs.check(loaded)?;
        if !read_only {
            let mut vol = fs.volume.lock();
            vol.sb.clean = 0;
            vol.dirty = true;
        }
        Ok(Arc::new(fs))
    }

    pub fn flavor(&self) -> Flavor {
        self.io.flavor
    }

    pub fn geometry(&self) -> &Geometry {
        &self.io.geo
    }

    /// 挂载时为纠正块大小而重读超级块的次数
    pub fn superblock_rereads(&self) -> u32 {
        self.rereads
    }

    pub fn base_bytes(&self) -> usize {
        self.base_bytes
    }

    pub fn is_read_only(&self) -> bool {
        self.volume.lock().read_only
    }

    pub fn ensure_writable(&self) -> FsResult<()> {
        if self.is_read_only() {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn superblock(&self) -> SuperBlock {
        self.volume.lock().sb.clone()
    }

    /// 卷的汇总计数
    pub fn totals(&self) -> Csum {
        self.volume.lock().sb.cstotal
    }

    pub fn group_summary(&self, cgx: u32) -> Csum {
        self.volume.lock().csum[cgx as usize]
    }

    /// 经过这里的结果如果是损坏类错误, 就把卷标记为坏并强制只读
    pub fn check<T>(&self, result: FsResult<T>) -> FsResult<T> {
        if let Err(e) = &result {
            if e.is_corruption() {
                self.mark_bad(e);
            }
        }
        result
    }

    fn mark_bad(&self, cause: &FsError) {
        error!("ufs error: {}", cause);
        let mut vol = self.volume.lock();
        if vol.read_only {
            return;
        }
        vol.sb.clean = FS_BAD;
        vol.read_only = true;
        vol.dirty = true;
        if let Err(e) = self.write_superblock(&mut vol) {
            error!("failed to record bad state in superblock: {}", e);
        }
    }

    fn write_superblock(&self, vol: &mut VolumeState) -> FsResult<()> {
        let fsize = self.io.geo.fsize as usize;
        let frag = (SBLOCK_OFFSET / fsize) as u32;
        let state_off = state_offset(self.io.flavor.dialect);
        let mut bytes = self.io.read_frags(frag, self.io.geo.sbsize as usize)?;
        vol.sb.encode(&mut bytes, &self.io.flavor.codec, state_off);
        self.io.write_frags(frag, &bytes)?;

        let mut cs_bytes = self.io.read_frags(self.io.geo.csaddr, self.io.geo.cssize as usize)?;
        for (c, cs) in vol.csum.iter().enumerate() {
            cs.encode(&mut cs_bytes[c * CSUM_SIZE..], &self.io.flavor.codec);
        }
        self.io.write_frags(self.io.geo.csaddr, &cs_bytes)?;
        vol.dirty = false;
        Ok(())
    }

    fn stamp(&self, vol: &mut VolumeState, clean: u8) {
        vol.sb.time = now();
        vol.sb.clean = clean;
        if state_offset(self.io.flavor.dialect).is_some() {
            vol.sb.state = FSOK.wrapping_sub(vol.sb.time);
        }
    }

    /// 把柱面组, 汇总区和超级块写回磁盘
    pub fn sync(&self) -> FsResult<()> {
        self.cgs.lock().flush_all(&self.io)?;
        {
            let mut vol = self.volume.lock();
            if !vol.read_only && vol.dirty {
                let clean = vol.sb.clean;
                self.stamp(&mut vol, clean);
                self.write_superblock(&mut vol)?;
            }
        }
        self.io.cache.sync_all()
    }

    /// 在读写和只读之间切换
    ///
    /// 切回只读时把卷标记为干净; 只读方言或者不干净的卷不允许切换成读写.
    pub fn remount(&self, read_only: bool) -> FsResult<()> {
        if read_only {
            self.cgs.lock().flush_all(&self.io)?;
            let mut vol = self.volume.lock();
            if vol.read_only {
                return Ok(());
            }
            self.stamp(&mut vol, FS_CLEAN);
            self.write_superblock(&mut vol)?;
            vol.read_only = true;
            drop(vol);
            info!("remounted read-only");
            return self.io.cache.sync_all();
        }
        if self.io.flavor.dialect.spec().read_only {
            warn!(
                "ufstype={} is supported read-only",
                self.io.flavor.dialect.spec().name
            );
            return Err(FsError::ReadOnly);
        }
        let mut vol = self.volume.lock();
        if !vol.read_only {
            return Ok(());
        }
        if !is_clean(&self.io.flavor, &vol.sb) {
            warn!("fs is not clean, refusing read-write remount");
            return Err(FsError::ReadOnly);
        }
        vol.read_only = false;
        vol.sb.clean = 0;
        vol.dirty = true;
        info!("remounted read-write");
        Ok(())
    }

    /// 卸载: 读写卷标记为干净后全部落盘
    pub fn unmount(&self) -> FsResult<()> {
        self.cgs.lock().flush_all(&self.io)?;
        {
            let mut vol = self.volume.lock();
            if !vol.read_only {
                self.stamp(&mut vol, FS_CLEAN);
                self.write_superblock(&mut vol)?;
            }
        }
        self.io.cache.sync_all()
    }

    /// 用位图重新数一遍, 与三层计数逐一比较
    pub fn audit_counters(&self) -> FsResult<()> {
        let mut cgs = self.cgs.lock();
        let mut total = Csum::default();
        for cgx in 0..self.io.geo.ncg {
            let (cs, ifree, bfree) = cgs.with_group(&self.io, cgx, |cg| {
                Ok((cg.cs(), cg.count_free_inodes() as u32, cg.count_free_blocks() as u32))
            })?;
            let summary = self.group_summary(cgx);
            if cs.nifree != ifree || cs.nbfree != bfree {
                return Err(FsError::corrupted(
                    "cylinder group",
                    format!(
                        "group {}: header counts {}/{} but bitmaps say {}/{}",
                        cgx, cs.nifree, cs.nbfree, ifree, bfree
                    ),
                ));
            }
            if summary.nifree != cs.nifree || summary.nbfree != cs.nbfree || summary.ndir != cs.ndir {
                return Err(FsError::corrupted(
                    "summary area",
                    format!("group {}: {:?} vs header {:?}", cgx, summary, cs),
                ));
            }
            total.nifree += cs.nifree;
            total.nbfree += cs.nbfree;
            total.ndir += cs.ndir;
        }
        let sb_total = self.totals();
        if sb_total.nifree != total.nifree
            || sb_total.nbfree != total.nbfree
            || sb_total.ndir != total.ndir
        {
            return Err(FsError::corrupted(
                "superblock",
                format!("totals {:?} vs groups {:?}", sb_total, total),
            ));
        }
        Ok(())
    }
}

impl Drop for UfsFileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            error!("unmount failed: {}", e);
        }
    }
}
