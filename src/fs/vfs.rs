//! UfsFileSystem 实现了磁盘布局并能够将磁盘块有效地管理起来.
//! 但是对于文件系统的使用者而言, 他们往往不关心磁盘布局是如何实现的, 而是更希望能够直接看到目录树结构中逻辑上的文件和目录.
//! 为此需要设计索引节点 [`Inode`] 暴露给文件系统的使用者, 让他们能够直接对文件和目录进行操作.
//!
//! DiskInode 放在磁盘块中比较固定的位置, 而 Inode 是放在内存中的句柄, 只记录索引节点号.
//!
//! 所有修改目录的操作都先持有相关索引节点的锁 (经 [`lock_ordered`] 一次性按序获取),
//! 再进入柱面组缓存/卷状态; 返回前经过 [`UfsFileSystem::check`], 损坏类错误会让卷变为只读.

use std::sync::Arc;

use log::{debug, warn};

use super::{
    dir::{check_name, DirCursor, DirItem, DirIter, DirSlot},
    inode::{allocated_frags, kind_of, InodeKind},
    layout::{DiskInode, NDADDR},
    locks::lock_ordered,
    ufs::{now, UfsFileSystem},
    FsError, FsResult, ROOT_INO, UFS_LINK_MAX,
};

/// 名字在查找和加锁之间被别人改掉时, 重试的次数上限
const RELOOKUP_RETRIES: usize = 8;

/// 宿主层填充通用索引节点对象所需的元数据
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub ino: u32,
    pub kind: InodeKind,
    pub perm: u16,
    pub nlink: u16,
    pub size: u64,
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub gen: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone)]
pub struct Inode {
    ino: u32,
    fs: Arc<UfsFileSystem>,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode").field("ino", &self.ino).finish_non_exhaustive()
    }
}

impl UfsFileSystem {
    pub fn root_inode(fs: &Arc<Self>) -> Inode {
        Inode::new(ROOT_INO, Arc::clone(fs))
    }

    /// 从根目录出发解析 "/a/b/c"
    pub fn resolve(fs: &Arc<Self>, path: &str) -> FsResult<Inode> {
        let mut cur = Self::root_inode(fs);
        for part in path.split('/').filter(|p| !p.is_empty()) {
            cur = cur.find(part)?.ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// 链接数归零的索引节点: 释放数据块和节点本身
    ///
    /// 宿主层在放下最后一个引用时调用; 本 crate 的名字空间操作在解锁后直接调用.
    pub fn evict(&self, ino: u32) -> FsResult<()> {
        self.check(self.evict_inner(ino))
    }

    fn evict_inner(&self, ino: u32) -> FsResult<()> {
        self.ensure_writable()?;
        let inode = self.read_inode(ino)?;
        if inode.nlink != 0 || inode.mode == 0 {
            return Ok(());
        }
        let kind = kind_of(ino, &inode)?;
        if kind.caps().owns_blocks && inode.blocks != 0 {
            self.release_blocks(ino, &inode)?;
        }
        let cleared = DiskInode {
            gen: inode.gen,
            ..DiskInode::default()
        };
        self.write_inode(ino, &cleared)?;
        self.free_inode(ino, kind.is_dir())?;
        self.locks.forget(ino);
        debug!("evict: inode {} ({:?})", ino, kind);
        Ok(())
    }

    fn release_blocks(&self, ino: u32, inode: &DiskInode) -> FsResult<()> {
        let geo = &self.io.geo;
        for lblk in 0..NDADDR {
            let addr = inode.db[lblk];
            if addr == 0 {
                continue;
            }
            self.free_frags(addr, allocated_frags(geo, inode, lblk))?;
        }
        if inode.ib.iter().any(|addr| *addr != 0) {
            warn!("evict: inode {}: indirect blocks are not reclaimed", ino);
        }
        Ok(())
    }
}

impl Inode {
    pub fn new(ino: u32, fs: Arc<UfsFileSystem>) -> Self {
        Self { ino, fs }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn fs(&self) -> &Arc<UfsFileSystem> {
        &self.fs
    }

    pub fn stat(&self) -> FsResult<Stat> {
        self.fs.check(self.stat_inner())
    }

    fn stat_inner(&self) -> FsResult<Stat> {
        let d = self.fs.read_inode(self.ino)?;
        Ok(Stat {
            ino: self.ino,
            kind: kind_of(self.ino, &d)?,
            perm: d.mode & 0o7777,
            nlink: d.nlink,
            size: d.size,
            blocks: d.blocks,
            atime: d.atime,
            mtime: d.mtime,
            ctime: d.ctime,
            gen: d.gen,
            uid: d.uid,
            gid: d.gid,
        })
    }

    pub fn kind(&self) -> FsResult<InodeKind> {
        self.fs.check(self.fs.inode_kind(self.ino))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), Ok(InodeKind::Directory))
    }

    fn require_dir(&self) -> FsResult<()> {
        if !self.fs.inode_kind(self.ino)?.caps().lookup {
            return Err(FsError::NotDirectory);
        }
        Ok(())
    }

    /// 在目录下按名字查找
    pub fn find(&self, name: &str) -> FsResult<Option<Inode>> {
        self.fs.check(self.find_inner(name))
    }

    fn find_inner(&self, name: &str) -> FsResult<Option<Inode>> {
        self.require_dir()?;
        Ok(self
            .fs
            .dir_lookup(self.ino, name.as_bytes())?
            .map(|slot| Inode::new(slot.ino, Arc::clone(&self.fs))))
    }

    /// 从游标处开始的惰性遍历, 会返回 "." 和 ".."
    pub fn read_dir(&self, cursor: DirCursor) -> FsResult<DirIter<'_>> {
        self.fs.check(self.require_dir())?;
        Ok(self.fs.dir_iter(self.ino, cursor))
    }

    /// 文件列举: 收集目录下除 "." 和 ".." 以外的名字
    pub fn ls(&self) -> FsResult<Vec<String>> {
        let mut names = Vec::new();
        for item in self.read_dir(DirCursor::default())? {
            let item = item?;
            if item.name != b"." && item.name != b".." {
                names.push(item.name_lossy());
            }
        }
        Ok(names)
    }

    /// 带元数据的列举
    pub fn entries(&self) -> FsResult<Vec<DirItem>> {
        self.read_dir(DirCursor::default())?.collect()
    }

    pub fn create(&self, name: &str, kind: InodeKind, perm: u16) -> FsResult<Inode> {
        let ino = self.fs.check(self.create_inner(name.as_bytes(), kind, perm))?;
        Ok(Inode::new(ino, Arc::clone(&self.fs)))
    }

    pub fn mkdir(&self, name: &str, perm: u16) -> FsResult<Inode> {
        self.create(name, InodeKind::Directory, perm)
    }

    fn create_inner(&self, name: &[u8], kind: InodeKind, perm: u16) -> FsResult<u32> {
        let fs = &self.fs;
        fs.ensure_writable()?;
        check_name(name)?;
        let node = fs.locks.get(self.ino);
        let _guard = lock_ordered(&[&*node]);

        let parent = fs.read_inode(self.ino)?;
        if !kind_of(self.ino, &parent)?.caps().mutate_entries {
            return Err(FsError::NotDirectory);
        }
        if parent.nlink == 0 {
            return Err(FsError::NotFound);
        }
        if fs.dir_lookup(self.ino, name)?.is_some() {
            return Err(FsError::Exists);
        }
        if kind.is_dir() && parent.nlink >= UFS_LINK_MAX {
            return Err(FsError::TooManyLinks);
        }

        let ino = fs.alloc_inode(self.ino, kind, perm)?;
        let built = if kind.is_dir() {
            fs.dir_make_empty(ino, self.ino)
                .and_then(|_| fs.modify_inode(ino, |i| i.nlink = 2))
        } else {
            fs.modify_inode(ino, |i| i.nlink = 1)
        };
        let inserted = built.and_then(|_| fs.dir_insert(self.ino, name, ino, kind.entry_type()));
        if let Err(e) = inserted {
            // 撤销: 链接数清零后按回收流程释放
            fs.modify_inode(ino, |i| i.nlink = 0)?;
            fs.evict_inner(ino)?;
            return Err(e);
        }
        if kind.is_dir() {
            fs.modify_inode(self.ino, |i| i.nlink += 1)?;
        }
        debug!(
            "create: {} -> inode {} in dir {}",
            String::from_utf8_lossy(name),
            ino,
            self.ino
        );
        Ok(ino)
    }

    /// 硬链接: 给 target 在本目录下再加一个名字
    pub fn link(&self, name: &str, target: &Inode) -> FsResult<()> {
        self.fs.check(self.link_inner(name.as_bytes(), target.ino))
    }

    fn link_inner(&self, name: &[u8], target: u32) -> FsResult<()> {
        let fs = &self.fs;
        fs.ensure_writable()?;
        check_name(name)?;
        self.require_dir()?;
        let parent = fs.locks.get(self.ino);
        let victim = fs.locks.get(target);
        let _guard = lock_ordered(&[&*parent, &*victim]);
        let inode = fs.read_inode(target)?;
        let kind = kind_of(target, &inode)?;
        if kind.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if inode.nlink == 0 {
            return Err(FsError::NotFound);
        }
        if inode.nlink >= UFS_LINK_MAX {
            return Err(FsError::TooManyLinks);
        }
        fs.dir_insert(self.ino, name, target, kind.entry_type())?;
        let t = now();
        fs.modify_inode(target, |i| {
            i.nlink += 1;
            i.ctime = t;
        })
    }

    /// 查找 name, 锁住目录和它指向的节点, 确认名字没有在加锁前被改掉, 再执行 f
    fn with_entry<V>(
        &self,
        name: &[u8],
        mut f: impl FnMut(&DirSlot) -> FsResult<V>,
    ) -> FsResult<V> {
        let fs = &self.fs;
        for _ in 0..RELOOKUP_RETRIES {
            let slot = fs.dir_lookup(self.ino, name)?.ok_or(FsError::NotFound)?;
            let parent = fs.locks.get(self.ino);
            let victim = fs.locks.get(slot.ino);
            let _guard = lock_ordered(&[&*parent, &*victim]);
            match fs.dir_lookup(self.ino, name)? {
                Some(current) if current.ino == slot.ino => return f(&current),
                Some(_) => continue,
                None => return Err(FsError::NotFound),
            }
        }
        warn!(
            "dir {}: {} keeps changing, giving up",
            self.ino,
            String::from_utf8_lossy(name)
        );
        Err(FsError::NotFound)
    }

    pub fn unlink(&self, name: &str) -> FsResult<()> {
        self.fs.check(self.unlink_inner(name.as_bytes()))
    }

    fn unlink_inner(&self, name: &[u8]) -> FsResult<()> {
        let fs = &self.fs;
        fs.ensure_writable()?;
        self.require_dir()?;
        let (ino, nlink) = self.with_entry(name, |slot| {
            if fs.inode_kind(slot.ino)?.is_dir() {
                return Err(FsError::IsDirectory);
            }
            fs.dir_delete(self.ino, slot)?;
            let t = now();
            let nlink = fs.modify_inode(slot.ino, |i| {
                i.nlink = i.nlink.saturating_sub(1);
                i.ctime = t;
                i.nlink
            })?;
            Ok((slot.ino, nlink))
        })?;
        if nlink == 0 {
            fs.evict_inner(ino)?;
        }
        Ok(())
    }

    pub fn rmdir(&self, name: &str) -> FsResult<()> {
        self.fs.check(self.rmdir_inner(name.as_bytes()))
    }

    fn rmdir_inner(&self, name: &[u8]) -> FsResult<()> {
        let fs = &self.fs;
        fs.ensure_writable()?;
        self.require_dir()?;
        if name == b"." || name == b".." {
            return Err(FsError::InvalidName(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }
        let ino = self.with_entry(name, |slot| {
            if !fs.inode_kind(slot.ino)?.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if !fs.dir_is_empty(slot.ino)? {
                return Err(FsError::NotEmpty);
            }
            fs.dir_delete(self.ino, slot)?;
            let t = now();
            fs.modify_inode(slot.ino, |i| {
                i.nlink = 0;
                i.ctime = t;
            })?;
            fs.modify_inode(self.ino, |i| i.nlink = i.nlink.saturating_sub(1))?;
            Ok(slot.ino)
        })?;
        fs.evict_inner(ino)
    }

    /// 把本目录下的 old_name 移到 new_dir 下的 new_name
    pub fn rename(&self, old_name: &str, new_dir: &Inode, new_name: &str) -> FsResult<()> {
        self.fs.rename(
            self.ino,
            old_name.as_bytes(),
            new_dir.ino,
            new_name.as_bytes(),
        )
    }
}
