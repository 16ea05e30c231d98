//! 格式化: 在块设备上写出一个全新的卷
//!
//! 每个柱面组 (单位: 碎片, 相对组起点):
//!
//! ```text
//! | 引导区 + 超级块副本 | 组描述符 | 索引节点区 | 数据区 ...                  |
//! 0                  cblkno     iblkno      dblkno                          fpg
//! ```
//!
//! 0 号组的数据区开头依次是柱面汇总区和根目录的第一块. 0, 1 号索引节点保留, 根目录是 2 号.

use std::sync::Arc;

use log::info;
use rand::Rng;

use super::{
    bitmap,
    block_cache::BlockCacheManager,
    dialect::{Dialect, CD_ALT_BASE_BLOCKS, SBLOCK_OFFSET, UFS_MAGIC, UFS_MAGIC_LFN},
    dir::RecordCodec,
    endian::{ByteOrder, Codec},
    geometry::{check_sizes, Geometry},
    inode::S_IFDIR,
    layout::{
        cg_off, Csum, DiskInode, SuperBlock, CG_MAGIC, CSUM_SIZE, DINODE_SIZE, DYNAMIC_POSTBLFMT,
        FSOK, FS_CLEAN,
    },
    probe::state_offset,
    ufs::now,
    BlockDevice, FsError, FsResult, BLOCK_CACHE_SIZE, DIRBLKSIZ, ROOT_INO,
};

/// 新卷的超级块大小
pub const NEW_SBSIZE: u32 = 2048;

/// 格式化参数
#[derive(Clone, Debug)]
pub struct FormatParams {
    pub dialect: Dialect,
    pub order: ByteOrder,
    pub bsize: u32,
    pub fsize: u32,
    pub ncg: u32,
    /// 每组索引节点数, 必须是每块索引节点数的整数倍
    pub ipg: u32,
    /// 每组碎片数, 必须是整块
    pub fpg: u32,
    /// 把卷放在 CD 风格的备用起点上 (只对 nextstep 系列有意义)
    pub alt_base: bool,
    /// 不指定时按方言取默认魔数
    pub magic: Option<u32>,
    /// 写出魔数在 980 字节处的旧式柱面组描述符
    pub old_cg_format: bool,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            dialect: Dialect::Bsd44,
            order: ByteOrder::host(),
            bsize: 4096,
            fsize: 1024,
            ncg: 4,
            ipg: 128,
            fpg: 2048,
            alt_base: false,
            magic: None,
            old_cg_format: false,
        }
    }
}

impl FormatParams {
    /// 卷起点的字节偏移
    pub fn base_bytes(&self) -> FsResult<usize> {
        if !self.alt_base {
            return Ok(0);
        }
        let spec = self.dialect.spec();
        if !spec.cd_alt_base {
            return Err(FsError::Config(format!(
                "ufstype={} has no alternate superblock base",
                spec.name
            )));
        }
        Ok(CD_ALT_BASE_BLOCKS * spec.trial_block_size)
    }

    /// 镜像需要的总字节数
    pub fn image_len(&self) -> FsResult<usize> {
        Ok(self.base_bytes()? + self.ncg as usize * self.fpg as usize * self.fsize as usize)
    }

    fn magic(&self) -> u32 {
        match (self.magic, self.dialect) {
            (Some(magic), _) => magic,
            // hp 的自动识别要求非标准魔数
            (None, Dialect::Hp) => UFS_MAGIC_LFN,
            (None, _) => UFS_MAGIC,
        }
    }
}

fn roundup(x: u32, y: u32) -> u32 {
    (x + y - 1) / y * y
}

fn howmany(x: u32, y: u32) -> u32 {
    (x + y - 1) / y
}

/// 由参数推出超级块
fn build_superblock(params: &FormatParams) -> FsResult<SuperBlock> {
    check_sizes(params.bsize, params.fsize)?;
    let bsize = params.bsize;
    let fsize = params.fsize;
    let frag = bsize / fsize;
    let inopb = bsize / DINODE_SIZE as u32;
    if params.ncg == 0 || params.ipg == 0 || params.ipg % inopb != 0 {
        return Err(FsError::Config(format!(
            "inodes per group {} must be a positive multiple of {}",
            params.ipg, inopb
        )));
    }
    if params.fpg == 0 || params.fpg % frag != 0 {
        return Err(FsError::Config(format!(
            "fragments per group {} must be a positive multiple of {}",
            params.fpg, frag
        )));
    }

    let sblkno = SBLOCK_OFFSET as u32 / fsize;
    let cblkno = roundup(sblkno + howmany(NEW_SBSIZE, fsize), frag);
    let cgsize = if params.old_cg_format {
        if params.ipg > 8 * (cg_off::OLD_MAGIC - cg_off::OLD_IUSED) as u32 {
            return Err(FsError::Config(format!(
                "old cylinder groups hold at most {} inodes",
                8 * (cg_off::OLD_MAGIC - cg_off::OLD_IUSED)
            )));
        }
        cg_off::OLD_FREE as u32 + howmany(params.fpg, 8)
    } else {
        cg_off::HEADER_SIZE as u32 + howmany(params.ipg, 8) + howmany(params.fpg, 8)
    };
    if cgsize > bsize {
        return Err(FsError::Config(format!(
            "cylinder group descriptor of {} bytes does not fit a {} byte block",
            cgsize, bsize
        )));
    }
    let iblkno = cblkno + roundup(howmany(cgsize, fsize), frag);
    let dblkno = iblkno + params.ipg / (inopb / frag);
    let cssize = roundup(params.ncg * CSUM_SIZE as u32, fsize);
    let cs_frags = roundup(howmany(cssize, fsize), frag);
    // 0 号组的数据区要放下汇总区, 根目录一块, 至少再留一块空闲
    if dblkno + cs_frags + 2 * frag > params.fpg {
        return Err(FsError::Config(format!(
            "{} fragments per group leave no room for data (metadata uses {})",
            params.fpg, dblkno
        )));
    }
    let time = now();
    let mut rng = rand::thread_rng();
    let size = params.ncg * params.fpg;
    Ok(SuperBlock {
        sblkno,
        cblkno,
        iblkno,
        dblkno,
        cgoffset: 0,
        cgmask: u32::MAX,
        time,
        size,
        dsize: size - params.ncg * dblkno - cs_frags,
        ncg: params.ncg,
        bsize,
        fsize,
        frag,
        minfree: 8,
        bmask: !(bsize - 1),
        fmask: !(fsize - 1),
        bshift: bsize.trailing_zeros(),
        fshift: fsize.trailing_zeros(),
        fragshift: frag.trailing_zeros(),
        fsbtodb: (fsize / 512).trailing_zeros(),
        sbsize: NEW_SBSIZE,
        nindir: bsize / 4,
        inopb,
        nspf: fsize / 512,
        id: [time, rng.gen()],
        csaddr: dblkno,
        cssize,
        cgsize,
        cpg: 1,
        ipg: params.ipg,
        fpg: params.fpg,
        cstotal: Csum::default(),
        fmod: 0,
        clean: FS_CLEAN,
        ronly: 0,
        flags: 0,
        cgrotor: 0,
        state: FSOK.wrapping_sub(time),
        postblformat: if params.dialect == Dialect::Bsd44 {
            DYNAMIC_POSTBLFMT
        } else {
            0
        },
        magic: params.magic(),
    })
}

/// 第 cgx 组的描述符和它的汇总计数
fn build_group(
    geo: &Geometry,
    codec: &Codec,
    cgx: u32,
    old_format: bool,
    reserved_frags: u32,
    time: u32,
) -> (Vec<u8>, Csum) {
    let ipg = geo.ipg as usize;
    let fpg = geo.fpg as usize;
    let frag = geo.frag as usize;
    let mut buf = vec![0u8; geo.cgsize as usize];
    let (iusedoff, freeoff) = if old_format {
        (cg_off::OLD_IUSED, cg_off::OLD_FREE)
    } else {
        (cg_off::HEADER_SIZE, cg_off::HEADER_SIZE + (ipg + 7) / 8)
    };

    let mut cs = Csum::default();
    {
        let inosused = &mut buf[iusedoff..iusedoff + (ipg + 7) / 8];
        if cgx == 0 {
            for bit in 0..=ROOT_INO as usize {
                bitmap::setbit(inosused, bit);
            }
            cs.ndir = 1;
        }
        cs.nifree = bitmap::count_zero(inosused, ipg) as u32;
    }
    {
        let blksfree = &mut buf[freeoff..freeoff + (fpg + 7) / 8];
        let first_free = (geo.dblkno + reserved_frags) as usize / frag;
        for blk in first_free..fpg / frag {
            bitmap::setblock(blksfree, frag, blk);
        }
        cs.nbfree = (fpg / frag - first_free) as u32;
    }

    let magic_off = if old_format { cg_off::OLD_MAGIC } else { cg_off::MAGIC };
    codec.put_u32(&mut buf, magic_off, CG_MAGIC);
    codec.put_u32(&mut buf, cg_off::TIME, time);
    codec.put_u32(&mut buf, cg_off::CGX, cgx);
    codec.put_u16(&mut buf, cg_off::NCYL, 1);
    codec.put_u16(&mut buf, cg_off::NIBLK, geo.ipg as u16);
    codec.put_u32(&mut buf, cg_off::NDBLK, geo.fpg);
    cs.encode(&mut buf[cg_off::CS..], codec);
    if !old_format {
        codec.put_u32(&mut buf, cg_off::BTOTOFF, cg_off::HEADER_SIZE as u32);
        codec.put_u32(&mut buf, cg_off::BOFF, cg_off::HEADER_SIZE as u32);
        codec.put_u32(&mut buf, cg_off::IUSEDOFF, iusedoff as u32);
        codec.put_u32(&mut buf, cg_off::FREEOFF, freeoff as u32);
        codec.put_u32(&mut buf, cg_off::NEXTFREEOFF, geo.cgsize);
    }
    (buf, cs)
}

/// 在 device 上写出一个全新的卷
pub fn format(device: &Arc<dyn BlockDevice>, params: &FormatParams) -> FsResult<()> {
    let mut sb = build_superblock(params)?;
    let geo = Geometry::from_superblock(&sb)?;
    let codec = Codec::new(params.order);
    let fsize = geo.fsize as usize;
    let base = params.base_bytes()?;
    let cache = BlockCacheManager::new(Arc::clone(device), fsize, base / fsize, BLOCK_CACHE_SIZE);

    let cs_frags = roundup(geo.cs_frags(), geo.frag);
    let root_block = geo.csaddr + cs_frags;
    let mut csum = Vec::with_capacity(geo.ncg as usize);
    for cgx in 0..geo.ncg {
        let reserved = if cgx == 0 { cs_frags + geo.frag } else { 0 };
        let (cg, cs) = build_group(&geo, &codec, cgx, params.old_cg_format, reserved, sb.time);
        cache.write_bytes(geo.cgtod(cgx) as usize, &cg)?;
        let table = vec![0u8; geo.ipg as usize * DINODE_SIZE];
        cache.write_bytes(geo.cgimin(cgx) as usize, &table)?;
        sb.cstotal.ndir += cs.ndir;
        sb.cstotal.nbfree += cs.nbfree;
        sb.cstotal.nifree += cs.nifree;
        sb.cstotal.nffree += cs.nffree;
        csum.push(cs);
        // 索引节点表较大, 每组写完就落盘
        cache.sync_all()?;
    }

    let mut cs_bytes = vec![0u8; (cs_frags * geo.fsize) as usize];
    for (c, cs) in csum.iter().enumerate() {
        cs.encode(&mut cs_bytes[c * CSUM_SIZE..], &codec);
    }
    cache.write_bytes(geo.csaddr as usize, &cs_bytes)?;

    let mut block = vec![0u8; geo.bsize as usize];
    let rc = RecordCodec::new(params.dialect.spec().dir_format, codec, geo.max_inodes());
    rc.make_empty(&mut block[..DIRBLKSIZ], ROOT_INO, ROOT_INO);
    cache.write_bytes(root_block as usize, &block)?;

    let mut root = DiskInode {
        mode: S_IFDIR | 0o755,
        nlink: 2,
        size: DIRBLKSIZ as u64,
        atime: sb.time,
        mtime: sb.time,
        ctime: sb.time,
        blocks: geo.bsize / 512,
        gen: rand::thread_rng().gen(),
        ..DiskInode::default()
    };
    root.db[0] = root_block;
    let (frag, off) = geo.inode_pos(ROOT_INO);
    cache
        .get_block_cache(frag as usize)?
        .lock()
        .modify(off, |bytes| root.encode(&mut bytes[..DINODE_SIZE], &codec));

    // 主超级块和每组的备份
    let state_off = state_offset(params.dialect);
    let mut sb_bytes = vec![0u8; sb.sbsize as usize];
    sb.encode(&mut sb_bytes, &codec, state_off);
    for cgx in 0..geo.ncg {
        cache.write_bytes((geo.cgstart(cgx) + geo.sblkno) as usize, &sb_bytes)?;
    }
    cache.sync_all()?;
    info!(
        "format: {} ({}) {} groups x {} frags, bsize {} fsize {}, {} inodes",
        params.dialect.spec().name,
        params.order.name(),
        geo.ncg,
        geo.fpg,
        geo.bsize,
        geo.fsize,
        geo.max_inodes()
    );
    Ok(())
}

/// 测试用: 内存中格式化并挂载
#[cfg(test)]
pub(crate) fn scratch_volume(
    params: FormatParams,
) -> (Arc<super::MemDevice>, Arc<super::UfsFileSystem>) {
    let mem = Arc::new(super::MemDevice::new(params.image_len().unwrap()));
    let dev: Arc<dyn BlockDevice> = mem.clone();
    format(&dev, &params).unwrap();
    let fs = super::UfsFileSystem::mount(
        dev,
        super::MountOptions {
            dialect: Some(params.dialect),
            ..Default::default()
        },
    )
    .unwrap();
    (mem, fs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout() {
        let sb = build_superblock(&FormatParams::default()).unwrap();
        assert_eq!(sb.sblkno, 8);
        assert_eq!(sb.cblkno, 12);
        assert_eq!(sb.iblkno, 16);
        assert_eq!(sb.dblkno, 32);
        assert_eq!(sb.cssize, 1024);
        assert_eq!(sb.postblformat, DYNAMIC_POSTBLFMT);
        let geo = Geometry::from_superblock(&sb).unwrap();
        assert_eq!(geo.max_inodes(), 512);
    }

    #[test]
    fn bad_parameters_are_config_errors() {
        let cases = [
            FormatParams {
                ipg: 100,
                ..FormatParams::default()
            },
            FormatParams {
                fpg: 40,
                ..FormatParams::default()
            },
            FormatParams {
                bsize: 65536,
                ..FormatParams::default()
            },
            FormatParams {
                bsize: 16384,
                fsize: 2048,
                ..FormatParams::default()
            },
            FormatParams {
                alt_base: true,
                ..FormatParams::default()
            },
            FormatParams {
                fpg: 2048 * 16,
                ..FormatParams::default()
            },
        ];
        for params in cases {
            let err = params.image_len().and_then(|_| build_superblock(&params).map(|_| ()));
            assert!(matches!(err, Err(FsError::Config(_))), "{:?}", params);
        }
    }

    #[test]
    fn fresh_volume_counters_add_up() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let geo = fs.geometry().clone();
        let total = fs.totals();
        assert_eq!(total.ndir, 1);
        assert_eq!(total.nifree, geo.max_inodes() - 3);
        assert_eq!(total.nbfree, (geo.fpg - geo.dblkno) / geo.frag * geo.ncg - 2);
        fs.audit_counters().unwrap();
        let root = fs.read_inode(ROOT_INO).unwrap();
        assert_eq!(root.nlink, 2);
        assert_eq!(root.size, DIRBLKSIZ as u64);
        assert_eq!(fs.dir_dotdot(ROOT_INO).unwrap().ino, ROOT_INO);
    }

    #[test]
    fn old_cylinder_groups_load() {
        let (_dev, fs) = scratch_volume(FormatParams {
            dialect: Dialect::Sun,
            old_cg_format: true,
            ..FormatParams::default()
        });
        let mut cgs = fs.cgs.lock();
        let format = cgs
            .with_group(&fs.io, 1, |cg| Ok(cg.format()))
            .unwrap();
        assert_eq!(format, crate::fs::cg_cache::CgFormat::Old);
    }
}
