//! 索引节点的读写与类型
//!
//! 索引节点号是 `组号 * ipg + 组内下标` 的纯算术映射, 0 和 1 号保留, 根目录是 2 号.
//! 每种文件类型能做什么由一张能力表 [`InodeKind::caps`] 决定, 而不是在各处分散判断.

use super::{
    dir::EntryType,
    geometry::Geometry,
    layout::{DiskInode, DINODE_SIZE},
    ufs::UfsFileSystem,
    FsError, FsResult,
};

pub const S_IFMT: u16 = 0o170000;
pub const S_IFIFO: u16 = 0o010000;
pub const S_IFCHR: u16 = 0o020000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFBLK: u16 = 0o060000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;
pub const S_IFSOCK: u16 = 0o140000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

/// 每种类型支持的操作
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindCaps {
    pub lookup: bool,
    pub iterate: bool,
    /// 可以作为 create/mkdir/rename 的父目录
    pub mutate_entries: bool,
    /// 内容存在数据块里, 回收时需要释放
    pub owns_blocks: bool,
}

impl InodeKind {
    pub fn from_mode(mode: u16) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFREG => Self::File,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => return None,
        })
    }

    pub fn mode_bits(self) -> u16 {
        match self {
            Self::File => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    pub fn entry_type(self) -> EntryType {
        match self {
            Self::File => EntryType::Regular,
            Self::Directory => EntryType::Directory,
            Self::Symlink => EntryType::Symlink,
            Self::CharDevice => EntryType::CharDevice,
            Self::BlockDevice => EntryType::BlockDevice,
            Self::Fifo => EntryType::Fifo,
            Self::Socket => EntryType::Socket,
        }
    }

    pub fn caps(self) -> KindCaps {
        match self {
            Self::Directory => KindCaps {
                lookup: true,
                iterate: true,
                mutate_entries: true,
                owns_blocks: true,
            },
            Self::File | Self::Symlink => KindCaps {
                lookup: false,
                iterate: false,
                mutate_entries: false,
                owns_blocks: true,
            },
            Self::CharDevice | Self::BlockDevice | Self::Fifo | Self::Socket => KindCaps {
                lookup: false,
                iterate: false,
                mutate_entries: false,
                owns_blocks: false,
            },
        }
    }

    pub fn is_dir(self) -> bool {
        self == Self::Directory
    }
}

impl UfsFileSystem {
    fn inode_location(&self, ino: u32) -> FsResult<(u32, usize)> {
        let geo = &self.io.geo;
        if ino < 2 || ino >= geo.max_inodes() {
            return Err(FsError::corrupted(
                "inode",
                format!("inode number {} out of range", ino),
            ));
        }
        Ok(geo.inode_pos(ino))
    }

    pub fn read_inode(&self, ino: u32) -> FsResult<DiskInode> {
        let (frag, off) = self.inode_location(ino)?;
        let codec = self.io.flavor.codec;
        Ok(self
            .io
            .cache
            .get_block_cache(frag as usize)?
            .lock()
            .read(off, |bytes| DiskInode::decode(&bytes[..DINODE_SIZE], &codec)))
    }

    pub fn write_inode(&self, ino: u32, inode: &DiskInode) -> FsResult<()> {
        let (frag, off) = self.inode_location(ino)?;
        let codec = self.io.flavor.codec;
        self.io
            .cache
            .get_block_cache(frag as usize)?
            .lock()
            .modify(off, |bytes| inode.encode(&mut bytes[..DINODE_SIZE], &codec));
        self.io.settle(frag)
    }

    /// 读出, 修改, 写回
    pub fn modify_inode<V>(&self, ino: u32, f: impl FnOnce(&mut DiskInode) -> V) -> FsResult<V> {
        let mut inode = self.read_inode(ino)?;
        let v = f(&mut inode);
        self.write_inode(ino, &inode)?;
        Ok(v)
    }

    /// 已分配的索引节点必须带有可识别的类型
    pub fn inode_kind(&self, ino: u32) -> FsResult<InodeKind> {
        let inode = self.read_inode(ino)?;
        kind_of(ino, &inode)
    }
}

/// 直接块 lblk 实际占用的碎片数
///
/// 只有最后一个直接块可能是不满一块的尾部碎片, 其大小由 di_blocks 反推.
/// 带间接块的节点一律按整块算.
pub fn allocated_frags(geo: &Geometry, inode: &DiskInode, lblk: usize) -> u32 {
    let last = match inode.db.iter().rposition(|addr| *addr != 0) {
        Some(last) => last,
        None => return 0,
    };
    if inode.db[lblk] == 0 {
        return 0;
    }
    if lblk < last || inode.ib.iter().any(|addr| *addr != 0) {
        return geo.frag;
    }
    let total = inode.blocks / (geo.fsize / 512);
    let tail = total.saturating_sub(last as u32 * geo.frag);
    tail.clamp(1, geo.frag)
}

pub fn kind_of(ino: u32, inode: &DiskInode) -> FsResult<InodeKind> {
    InodeKind::from_mode(inode.mode).ok_or_else(|| {
        FsError::corrupted(
            "inode",
            format!("inode {} has unknown mode {:#o}", ino, inode.mode),
        )
    })
}
