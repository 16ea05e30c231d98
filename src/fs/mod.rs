//! BSD UFS 的磁盘元数据引擎
//!
//! 自下而上:
//!
//! - 块设备接口 [`BlockDevice`] 与块缓存 [`BlockCacheManager`];
//! - 字节序编解码 [`Codec`] 与方言表 [`Dialect`], 二者合成挂载期不可变的 [`Flavor`];
//! - 磁盘数据结构 (超级块, 柱面组, 索引节点) 与由超级块推出的 [`Geometry`];
//! - 挂载试探, 柱面组缓存, 索引节点/数据块分配器, 目录记录编解码, 重命名;
//! - 对外的 [`UfsFileSystem`] 与索引节点句柄 [`Inode`].

mod balloc;
mod bitmap;
mod block_cache;
mod block_dev;
mod cg_cache;
mod dialect;
mod dir;
mod endian;
mod error;
mod geometry;
mod ialloc;
mod inode;
mod layout;
mod locks;
mod mkfs;
mod probe;
mod rename;
mod ufs;
mod vfs;

extern crate log;

/// 目录块大小: 目录记录永远不会跨越它
pub const DIRBLKSIZ: usize = 512;
/// 文件名的最大长度
pub const MAXNAMLEN: usize = 255;
/// 链接数上限
pub const UFS_LINK_MAX: u16 = 32000;
/// 根目录的索引节点号
pub const ROOT_INO: u32 = 2;
/// 为了避免在块缓存上浪费过多内存, 内存中同时只能驻留有限个碎片的缓冲区
pub const BLOCK_CACHE_SIZE: usize = 64;

pub use block_cache::BlockCacheManager;
pub use block_dev::{BlockDevice, MemDevice};
pub use dialect::{Dialect, Flavor};
pub use dir::{DirCursor, DirItem, DirIter, DirSlot, EntryType};
pub use endian::{ByteOrder, Codec};
pub use error::{FsError, FsResult};
pub use geometry::Geometry;
pub use inode::InodeKind;
pub use layout::{Csum, SuperBlock, FS_BAD, FS_CLEAN};
pub use mkfs::{format, FormatParams};
pub use ufs::{MountOptions, UfsFileSystem};
pub use vfs::{Inode, Stat};
