//! 磁盘数据结构层: [`SuperBlock`], [`Csum`], 柱面组头部偏移, [`DiskInode`]
//!
//! 这些结构不能直接按 `#[repr(C)]` 强转缓冲区, 因为磁盘字节序随方言而变,
//! 所以每个结构都以 "字段偏移 + [`Codec`]" 的方式解码/编码.
//!
//! 卷布局 (单位: 碎片, 相对每个柱面组的起点 cgstart):
//!
//! - 引导块 + 超级块副本: [0, cblkno)
//! - 柱面组描述符: [cblkno, iblkno)
//! - 索引节点区: [iblkno, dblkno)
//! - 数据区: [dblkno, fpg), 0 号组的数据区开头是柱面汇总区 (csaddr)

use std::fmt::{Debug, Formatter, Result};

use super::endian::Codec;

/// 干净卸载判定用的常量
pub const FSOK: u32 = 0x7c26_9d38;
pub const FS_ACTIVE: u8 = 0x00;
pub const FS_CLEAN: u8 = 0x01;
pub const FS_STABLE: u8 = 0x02;
pub const FS_OSF1: u8 = 0x03;
pub const FS_LOG: u8 = 0xfd;
pub const FS_BAD: u8 = 0xff;

/// 超级块内的字段偏移 (UFS1)
mod sb_off {
    pub const SBLKNO: usize = 8;
    pub const CBLKNO: usize = 12;
    pub const IBLKNO: usize = 16;
    pub const DBLKNO: usize = 20;
    pub const CGOFFSET: usize = 24;
    pub const CGMASK: usize = 28;
    pub const TIME: usize = 32;
    pub const SIZE: usize = 36;
    pub const DSIZE: usize = 40;
    pub const NCG: usize = 44;
    pub const BSIZE: usize = 48;
    pub const FSIZE: usize = 52;
    pub const FRAG: usize = 56;
    pub const MINFREE: usize = 60;
    pub const BMASK: usize = 72;
    pub const FMASK: usize = 76;
    pub const BSHIFT: usize = 80;
    pub const FSHIFT: usize = 84;
    pub const FRAGSHIFT: usize = 96;
    pub const FSBTODB: usize = 100;
    pub const SBSIZE: usize = 104;
    pub const NINDIR: usize = 116;
    pub const INOPB: usize = 120;
    pub const NSPF: usize = 124;
    pub const ID: usize = 144;
    pub const CSADDR: usize = 152;
    pub const CSSIZE: usize = 156;
    pub const CGSIZE: usize = 160;
    pub const CPG: usize = 180;
    pub const IPG: usize = 184;
    pub const FPG: usize = 188;
    pub const CSTOTAL: usize = 192;
    pub const FMOD: usize = 208;
    pub const CLEAN: usize = 209;
    pub const RONLY: usize = 210;
    pub const FLAGS: usize = 211;
    pub const CGROTOR: usize = 724;
    pub const POSTBLFORMAT: usize = 1356;
    pub const MAGIC: usize = 1372;
}

pub use sb_off::MAGIC as SB_MAGIC_OFFSET;

/// 超级块至少要覆盖到魔数
pub const SB_MIN_SIZE: usize = 1376;
/// 超级块的最大尺寸
pub const SBLOCKSIZE: usize = 8192;
pub const DYNAMIC_POSTBLFMT: u32 = 1;

/// 每组的汇总信息, 在超级块总计, 柱面组头部和汇总区中各有一份
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Csum {
    pub ndir: u32,
    pub nbfree: u32,
    pub nifree: u32,
    pub nffree: u32,
}

pub const CSUM_SIZE: usize = 16;

impl Csum {
    pub fn decode(buf: &[u8], codec: &Codec) -> Self {
        Self {
            ndir: codec.get_u32(buf, 0),
            nbfree: codec.get_u32(buf, 4),
            nifree: codec.get_u32(buf, 8),
            nffree: codec.get_u32(buf, 12),
        }
    }

    pub fn encode(&self, buf: &mut [u8], codec: &Codec) {
        codec.put_u32(buf, 0, self.ndir);
        codec.put_u32(buf, 4, self.nbfree);
        codec.put_u32(buf, 8, self.nifree);
        codec.put_u32(buf, 12, self.nffree);
    }
}

#[derive(Clone, Default)]
pub struct SuperBlock {
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    pub cgoffset: u32,
    pub cgmask: u32,
    pub time: u32,
    pub size: u32,
    pub dsize: u32,
    pub ncg: u32,
    pub bsize: u32,
    pub fsize: u32,
    pub frag: u32,
    pub minfree: u32,
    pub bmask: u32,
    pub fmask: u32,
    pub bshift: u32,
    pub fshift: u32,
    pub fragshift: u32,
    pub fsbtodb: u32,
    pub sbsize: u32,
    pub nindir: u32,
    pub inopb: u32,
    pub nspf: u32,
    pub id: [u32; 2],
    pub csaddr: u32,
    pub cssize: u32,
    pub cgsize: u32,
    pub cpg: u32,
    pub ipg: u32,
    pub fpg: u32,
    pub cstotal: Csum,
    pub fmod: u8,
    pub clean: u8,
    pub ronly: u8,
    pub flags: u8,
    pub cgrotor: u32,
    /// 方言相关位置上的状态字, 没有时为 0
    pub state: u32,
    pub postblformat: u32,
    pub magic: u32,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("bsize", &self.bsize)
            .field("fsize", &self.fsize)
            .field("frag", &self.frag)
            .field("sbsize", &self.sbsize)
            .field("ncg", &self.ncg)
            .field("ipg", &self.ipg)
            .field("fpg", &self.fpg)
            .field("cstotal", &self.cstotal)
            .field("clean", &self.clean)
            .field("time", &self.time)
            .finish()
    }
}

impl SuperBlock {
    /// 从超级块字节中解码; state_off 为方言状态字的位置
    pub fn decode(buf: &[u8], codec: &Codec, state_off: Option<usize>) -> Self {
        use sb_off::*;
        let g = |off| codec.get_u32(buf, off);
        Self {
            sblkno: g(SBLKNO),
            cblkno: g(CBLKNO),
            iblkno: g(IBLKNO),
            dblkno: g(DBLKNO),
            cgoffset: g(CGOFFSET),
            cgmask: g(CGMASK),
            time: g(TIME),
            size: g(SIZE),
            dsize: g(DSIZE),
            ncg: g(NCG),
            bsize: g(BSIZE),
            fsize: g(FSIZE),
            frag: g(FRAG),
            minfree: g(MINFREE),
            bmask: g(BMASK),
            fmask: g(FMASK),
            bshift: g(BSHIFT),
            fshift: g(FSHIFT),
            fragshift: g(FRAGSHIFT),
            fsbtodb: g(FSBTODB),
            sbsize: g(SBSIZE),
            nindir: g(NINDIR),
            inopb: g(INOPB),
            nspf: g(NSPF),
            id: [g(ID), g(ID + 4)],
            csaddr: g(CSADDR),
            cssize: g(CSSIZE),
            cgsize: g(CGSIZE),
            cpg: g(CPG),
            ipg: g(IPG),
            fpg: g(FPG),
            cstotal: Csum::decode(&buf[CSTOTAL..], codec),
            fmod: buf[FMOD],
            clean: buf[CLEAN],
            ronly: buf[RONLY],
            flags: buf[FLAGS],
            cgrotor: g(CGROTOR),
            state: state_off.map(g).unwrap_or(0),
            postblformat: g(POSTBLFORMAT),
            magic: g(MAGIC),
        }
    }

    /// 把全部已知字段写回缓冲区, 未知字段保持原样
    pub fn encode(&self, buf: &mut [u8], codec: &Codec, state_off: Option<usize>) {
        use sb_off::*;
        let mut p = |off, v| codec.put_u32(buf, off, v);
        p(SBLKNO, self.sblkno);
        p(CBLKNO, self.cblkno);
        p(IBLKNO, self.iblkno);
        p(DBLKNO, self.dblkno);
        p(CGOFFSET, self.cgoffset);
        p(CGMASK, self.cgmask);
        p(TIME, self.time);
        p(SIZE, self.size);
        p(DSIZE, self.dsize);
        p(NCG, self.ncg);
        p(BSIZE, self.bsize);
        p(FSIZE, self.fsize);
        p(FRAG, self.frag);
        p(MINFREE, self.minfree);
        p(BMASK, self.bmask);
        p(FMASK, self.fmask);
        p(BSHIFT, self.bshift);
        p(FSHIFT, self.fshift);
        p(FRAGSHIFT, self.fragshift);
        p(FSBTODB, self.fsbtodb);
        p(SBSIZE, self.sbsize);
        p(NINDIR, self.nindir);
        p(INOPB, self.inopb);
        p(NSPF, self.nspf);
        p(ID, self.id[0]);
        p(ID + 4, self.id[1]);
        p(CSADDR, self.csaddr);
        p(CSSIZE, self.cssize);
        p(CGSIZE, self.cgsize);
        p(CPG, self.cpg);
        p(IPG, self.ipg);
        p(FPG, self.fpg);
        p(CGROTOR, self.cgrotor);
        p(POSTBLFORMAT, self.postblformat);
        p(MAGIC, self.magic);
        if let Some(off) = state_off {
            p(off, self.state);
        }
        self.cstotal.encode(&mut buf[CSTOTAL..], codec);
        buf[FMOD] = self.fmod;
        buf[CLEAN] = self.clean;
        buf[RONLY] = self.ronly;
        buf[FLAGS] = self.flags;
    }
}

/// 柱面组描述符
pub const CG_MAGIC: u32 = 0x0009_0255;

pub mod cg_off {
    pub const MAGIC: usize = 4;
    pub const TIME: usize = 8;
    pub const CGX: usize = 12;
    pub const NCYL: usize = 16;
    pub const NIBLK: usize = 18;
    pub const NDBLK: usize = 20;
    pub const CS: usize = 24;
    pub const CS_NDIR: usize = CS;
    pub const CS_NBFREE: usize = CS + 4;
    pub const CS_NIFREE: usize = CS + 8;
    pub const CS_NFFREE: usize = CS + 12;
    pub const ROTOR: usize = 40;
    pub const IROTOR: usize = 48;
    pub const BTOTOFF: usize = 84;
    pub const BOFF: usize = 88;
    pub const IUSEDOFF: usize = 92;
    pub const FREEOFF: usize = 96;
    pub const NEXTFREEOFF: usize = 100;
    /// 新格式头部的长度, 位图紧随其后
    pub const HEADER_SIZE: usize = 168;

    /// 旧格式柱面组: 位图位置固定
    pub const OLD_IUSED: usize = 724;
    pub const OLD_MAGIC: usize = 980;
    pub const OLD_FREE: usize = 984;
}

/// 磁盘上 UFS1 索引节点
pub const DINODE_SIZE: usize = 128;
pub const NDADDR: usize = 12;
pub const NIADDR: usize = 3;

mod di_off {
    pub const MODE: usize = 0;
    pub const NLINK: usize = 2;
    pub const SIZE: usize = 8;
    pub const ATIME: usize = 16;
    pub const MTIME: usize = 24;
    pub const CTIME: usize = 32;
    pub const DB: usize = 40;
    pub const IB: usize = 88;
    pub const FLAGS: usize = 100;
    pub const BLOCKS: usize = 104;
    pub const GEN: usize = 108;
    pub const UID: usize = 112;
    pub const GID: usize = 116;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskInode {
    pub mode: u16,
    pub nlink: u16,
    /// 文件/目录内容的字节数
    pub size: u64,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// 直接块地址 (碎片地址)
    pub db: [u32; NDADDR],
    pub ib: [u32; NIADDR],
    pub flags: u32,
    /// 占用的 512 字节扇区数
    pub blocks: u32,
    pub gen: u32,
    pub uid: u32,
    pub gid: u32,
}

impl DiskInode {
    pub fn decode(buf: &[u8], codec: &Codec) -> Self {
        use di_off::*;
        let mut db = [0u32; NDADDR];
        for (i, slot) in db.iter_mut().enumerate() {
            *slot = codec.get_u32(buf, DB + 4 * i);
        }
        let mut ib = [0u32; NIADDR];
        for (i, slot) in ib.iter_mut().enumerate() {
            *slot = codec.get_u32(buf, IB + 4 * i);
        }
        Self {
            mode: codec.get_u16(buf, MODE),
            nlink: codec.get_u16(buf, NLINK),
            size: codec.get_u64(buf, SIZE),
            atime: codec.get_u32(buf, ATIME),
            mtime: codec.get_u32(buf, MTIME),
            ctime: codec.get_u32(buf, CTIME),
            db,
            ib,
            flags: codec.get_u32(buf, FLAGS),
            blocks: codec.get_u32(buf, BLOCKS),
            gen: codec.get_u32(buf, GEN),
            uid: codec.get_u32(buf, UID),
            gid: codec.get_u32(buf, GID),
        }
    }

    pub fn encode(&self, buf: &mut [u8], codec: &Codec) {
        use di_off::*;
        codec.put_u16(buf, MODE, self.mode);
        codec.put_u16(buf, NLINK, self.nlink);
        codec.put_u64(buf, SIZE, self.size);
        codec.put_u32(buf, ATIME, self.atime);
        codec.put_u32(buf, MTIME, self.mtime);
        codec.put_u32(buf, CTIME, self.ctime);
        for (i, addr) in self.db.iter().enumerate() {
            codec.put_u32(buf, DB + 4 * i, *addr);
        }
        for (i, addr) in self.ib.iter().enumerate() {
            codec.put_u32(buf, IB + 4 * i, *addr);
        }
        codec.put_u32(buf, FLAGS, self.flags);
        codec.put_u32(buf, BLOCKS, self.blocks);
        codec.put_u32(buf, GEN, self.gen);
        codec.put_u32(buf, UID, self.uid);
        codec.put_u32(buf, GID, self.gid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::endian::ByteOrder;

    #[test]
    fn superblock_fields_land_at_ufs1_offsets() {
        let codec = Codec::new(ByteOrder::Big);
        let mut buf = vec![0u8; 2048];
        let sb = SuperBlock {
            bsize: 8192,
            fsize: 1024,
            ncg: 3,
            magic: 0x0001_1954,
            clean: FS_CLEAN,
            cstotal: Csum {
                nifree: 77,
                ..Csum::default()
            },
            ..SuperBlock::default()
        };
        sb.encode(&mut buf, &codec, Some(1332));
        assert_eq!(&buf[1372..1376], &[0x00, 0x01, 0x19, 0x54]);
        assert_eq!(&buf[48..52], &[0x00, 0x00, 0x20, 0x00]);
        assert_eq!(buf[209], FS_CLEAN);
        let back = SuperBlock::decode(&buf, &codec, Some(1332));
        assert_eq!(back.ncg, 3);
        assert_eq!(back.cstotal.nifree, 77);
    }

    #[test]
    fn dinode_is_128_bytes_and_keeps_addresses() {
        let codec = Codec::new(ByteOrder::Little);
        let mut buf = [0u8; DINODE_SIZE];
        let mut ino = DiskInode {
            mode: 0o040755,
            nlink: 2,
            size: 512,
            ..DiskInode::default()
        };
        ino.db[0] = 1234;
        ino.db[NDADDR - 1] = 99;
        ino.encode(&mut buf, &codec);
        assert_eq!(DiskInode::decode(&buf, &codec), ino);
        assert_eq!(codec.get_u32(&buf, 40), 1234);
    }
}
