//! 几何描述符: 挂载时由超级块的原始字段算出的只读参数
//!
//! 所有移位/掩码都从 bsize/fsize 等原始字段推导, 而不是直接相信盘上存的派生值,
//! 这样它们之间一定自洽.

use super::{
    layout::{SuperBlock, CSUM_SIZE, DINODE_SIZE, NDADDR, SBLOCKSIZE},
    FsError, FsResult, DIRBLKSIZ,
};

/// 只认这三种块大小
pub const BSIZES: [u32; 3] = [4096, 8192, 32768];
pub const MIN_FSIZE: u32 = 512;
pub const MAX_FSIZE: u32 = 4096;
pub const MAX_FRAG: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub bsize: u32,
    pub fsize: u32,
    /// 每块的碎片数
    pub frag: u32,
    pub bshift: u32,
    pub fshift: u32,
    pub bmask: u32,
    pub fmask: u32,
    pub fragshift: u32,
    /// 碎片地址 -> 512 字节扇区地址的移位
    pub fsbtodb: u32,
    pub sbsize: u32,
    pub ncg: u32,
    pub ipg: u32,
    pub fpg: u32,
    pub inopb: u32,
    pub inopf: u32,
    pub nindir: u32,
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    pub cgoffset: u32,
    pub cgmask: u32,
    pub csaddr: u32,
    pub cssize: u32,
    pub cgsize: u32,
    /// 卷总碎片数
    pub size: u32,
}

fn log2(x: u32) -> u32 {
    x.trailing_zeros()
}

/// 校验块/碎片大小; 试探阶段在重读之前就要调用
pub fn check_sizes(bsize: u32, fsize: u32) -> FsResult<()> {
    if !fsize.is_power_of_two() || !(MIN_FSIZE..=MAX_FSIZE).contains(&fsize) {
        return Err(FsError::Config(format!("unsupported fragment size {}", fsize)));
    }
    if !BSIZES.contains(&bsize) {
        return Err(FsError::Config(format!("unsupported block size {}", bsize)));
    }
    if bsize / fsize > MAX_FRAG {
        return Err(FsError::Config(format!(
            "too many fragments per block ({} / {})",
            bsize, fsize
        )));
    }
    Ok(())
}

impl Geometry {
    pub fn from_superblock(sb: &SuperBlock) -> FsResult<Self> {
        check_sizes(sb.bsize, sb.fsize)?;
        let frag = sb.bsize / sb.fsize;
        if sb.frag != 0 && sb.frag != frag {
            return Err(FsError::Config(format!(
                "fs_frag {} disagrees with bsize/fsize {}",
                sb.frag, frag
            )));
        }
        if sb.sbsize as usize > SBLOCKSIZE || (sb.sbsize as usize) < super::layout::SB_MIN_SIZE {
            return Err(FsError::Config(format!("bad superblock size {}", sb.sbsize)));
        }
        let inopb = sb.bsize / DINODE_SIZE as u32;
        if sb.ncg == 0 || sb.ipg == 0 || sb.fpg == 0 {
            return Err(FsError::Config("empty cylinder group geometry".into()));
        }
        if sb.ipg % inopb != 0 || sb.fpg % frag != 0 {
            return Err(FsError::Config(format!(
                "ipg {} / fpg {} not block aligned",
                sb.ipg, sb.fpg
            )));
        }
        if (sb.cssize as usize) < sb.ncg as usize * CSUM_SIZE {
            return Err(FsError::Config(format!(
                "summary area of {} bytes cannot hold {} groups",
                sb.cssize, sb.ncg
            )));
        }
        if sb.cgsize > sb.bsize {
            return Err(FsError::Config(format!(
                "cylinder group size {} exceeds block size",
                sb.cgsize
            )));
        }
        let geo = Self {
            bsize: sb.bsize,
            fsize: sb.fsize,
            frag,
            bshift: log2(sb.bsize),
            fshift: log2(sb.fsize),
            bmask: !(sb.bsize - 1),
            fmask: !(sb.fsize - 1),
            fragshift: log2(frag),
            fsbtodb: log2(sb.fsize / 512),
            sbsize: sb.sbsize,
            ncg: sb.ncg,
            ipg: sb.ipg,
            fpg: sb.fpg,
            inopb,
            inopf: inopb / frag,
            nindir: sb.bsize / 4,
            sblkno: sb.sblkno,
            cblkno: sb.cblkno,
            iblkno: sb.iblkno,
            dblkno: sb.dblkno,
            cgoffset: sb.cgoffset,
            cgmask: sb.cgmask,
            csaddr: sb.csaddr,
            cssize: sb.cssize,
            cgsize: sb.cgsize,
            size: sb.size,
        };
        if geo.dblkno >= geo.fpg || geo.iblkno + geo.ipg / geo.inopf > geo.dblkno {
            return Err(FsError::Config("cylinder group layout overlaps".into()));
        }
        Ok(geo)
    }

    /// 柱面组 c 的起始碎片地址
    pub fn cgbase(&self, c: u32) -> u32 {
        self.fpg * c
    }

    pub fn cgstart(&self, c: u32) -> u32 {
        self.cgbase(c) + self.cgoffset * (c & !self.cgmask)
    }

    /// 柱面组描述符所在碎片
    pub fn cgtod(&self, c: u32) -> u32 {
        self.cgstart(c) + self.cblkno
    }

    pub fn cgimin(&self, c: u32) -> u32 {
        self.cgstart(c) + self.iblkno
    }

    pub fn blkstofrags(&self, blks: u32) -> u32 {
        blks << self.fragshift
    }

    pub fn fragstoblks(&self, frags: u32) -> u32 {
        frags >> self.fragshift
    }

    /// 碎片地址所在的柱面组
    pub fn dtog(&self, frag: u32) -> u32 {
        frag / self.fpg
    }

    pub fn dtogd(&self, frag: u32) -> u32 {
        frag % self.fpg
    }

    pub fn max_inodes(&self) -> u32 {
        self.ncg * self.ipg
    }

    pub fn ino_to_cg(&self, ino: u32) -> u32 {
        ino / self.ipg
    }

    pub fn ino_to_cgoff(&self, ino: u32) -> u32 {
        ino % self.ipg
    }

    /// 索引节点所在块的碎片地址
    pub fn ino_to_fsba(&self, ino: u32) -> u32 {
        self.cgimin(self.ino_to_cg(ino)) + self.blkstofrags(self.ino_to_cgoff(ino) / self.inopb)
    }

    /// 索引节点在其块内的序号
    pub fn ino_to_fsbo(&self, ino: u32) -> u32 {
        ino % self.inopb
    }

    /// (碎片地址, 碎片内字节偏移)
    pub fn inode_pos(&self, ino: u32) -> (u32, usize) {
        let byte = (self.ino_to_fsbo(ino) as usize) * DINODE_SIZE;
        (
            self.ino_to_fsba(ino) + (byte >> self.fshift) as u32,
            byte & (self.fsize as usize - 1),
        )
    }

    /// 目录可以达到的最大字节数: 只用直接块
    pub fn max_dir_size(&self) -> u64 {
        NDADDR as u64 * self.bsize as u64
    }

    pub fn chunks_per_block(&self) -> u32 {
        self.bsize / DIRBLKSIZ as u32
    }

    /// 汇总区占用的碎片数
    pub fn cs_frags(&self) -> u32 {
        (self.cssize + self.fsize - 1) >> self.fshift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sb() -> SuperBlock {
        SuperBlock {
            bsize: 4096,
            fsize: 1024,
            frag: 4,
            sbsize: 2048,
            ncg: 4,
            ipg: 128,
            fpg: 2048,
            sblkno: 8,
            cblkno: 12,
            iblkno: 16,
            dblkno: 32,
            cssize: 64,
            cgsize: 1024,
            size: 8192,
            ..SuperBlock::default()
        }
    }

    #[test]
    fn derived_values_are_consistent() {
        let g = Geometry::from_superblock(&sample_sb()).unwrap();
        assert_eq!(g.frag, 4);
        assert_eq!(g.bshift, 12);
        assert_eq!(g.fshift, 10);
        assert_eq!(g.fragshift, 2);
        assert_eq!(g.fsbtodb, 1);
        assert_eq!(g.bmask, !4095);
        assert_eq!(g.inopb, 32);
        assert_eq!(g.inopf, 8);
        assert_eq!(g.chunks_per_block(), 8);
    }

    #[test]
    fn inode_numbers_decompose_arithmetically() {
        let g = Geometry::from_superblock(&sample_sb()).unwrap();
        let ino = 2 * 128 + 37;
        assert_eq!(g.ino_to_cg(ino), 2);
        assert_eq!(g.ino_to_cgoff(ino), 37);
        // 37 / 32 = 1 号块, 块内第 5 个, 偏移 640 字节
        let (frag, off) = g.inode_pos(ino);
        assert_eq!(frag, 2 * 2048 + 16 + 4);
        assert_eq!(off, 640);
    }

    #[test]
    fn rejects_unsupported_sizes() {
        let mut sb = sample_sb();
        sb.bsize = 2048;
        assert!(Geometry::from_superblock(&sb).is_err());
        let mut sb = sample_sb();
        sb.fsize = 256;
        assert!(Geometry::from_superblock(&sb).is_err());
        let mut sb = sample_sb();
        sb.bsize = 32768;
        sb.fsize = 1024;
        sb.frag = 0;
        assert!(matches!(
            Geometry::from_superblock(&sb),
            Err(FsError::Config(_))
        ));
    }

    #[test]
    fn only_listed_block_sizes_pass() {
        assert!(check_sizes(4096, 1024).is_ok());
        assert!(check_sizes(8192, 1024).is_ok());
        assert!(check_sizes(32768, 4096).is_ok());
        // 16K 是 2 的幂, 碎片数也合法, 仍然不接受
        assert!(matches!(check_sizes(16384, 2048), Err(FsError::Config(_))));
        assert!(matches!(check_sizes(65536, 8192), Err(FsError::Config(_))));

        let mut sb = sample_sb();
        sb.bsize = 16384;
        sb.fsize = 2048;
        sb.frag = 8;
        assert!(matches!(
            Geometry::from_superblock(&sb),
            Err(FsError::Config(_))
        ));
    }
}
