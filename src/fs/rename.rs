//! 重命名
//!
//! 分两个阶段:
//!
//! 1. 校验 (不加锁, 没有副作用): 源存在, 目标类型兼容, 被替换的目录为空,
//!    被移动目录的 ".." 确实指向原父目录, 新父目录的链接数还没到上限.
//! 2. 通过 [`lock_ordered`] 一次性锁住两个父目录, 源和目标, 重新校验一遍 (名字可能在加锁前被改掉, 改了就重来),
//!    然后依次: 插入或改写目标项, 删除源项, 改写 "..", 调整链接数.
//!
//! 第二阶段的第一步 (插入新目录项) 失败时什么都还没改, 错误原样返回;
//! 之后的任何失败都意味着目录树处于半完成状态, 一律按损坏处理.
//! 被替换的节点链接数归零后, 在释放所有锁之后再回收.

use log::{debug, warn};

use super::{
    dir::{check_name, DirSlot, EntryType},
    inode::{kind_of, InodeKind},
    locks::lock_ordered,
    ufs::{now, UfsFileSystem},
    FsError, FsResult, ROOT_INO, UFS_LINK_MAX,
};

const RELOOKUP_RETRIES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RenamePlan {
    src: DirSlot,
    src_kind: InodeKind,
    dst: Option<(DirSlot, InodeKind)>,
}

impl RenamePlan {
    fn is_noop(&self) -> bool {
        matches!(self.dst, Some((slot, _)) if slot.ino == self.src.ino)
    }
}

fn reject_dots(name: &[u8]) -> FsResult<()> {
    if name == b"." || name == b".." {
        return Err(FsError::Invalid(format!(
            "cannot rename {}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

impl UfsFileSystem {
    /// 把 old_dir 下的 old_name 移到 new_dir 下的 new_name
    pub fn rename(&self, old_dir: u32, old_name: &[u8], new_dir: u32, new_name: &[u8]) -> FsResult<()> {
        let replaced = self.check(self.rename_inner(old_dir, old_name, new_dir, new_name))?;
        if let Some(ino) = replaced {
            self.evict(ino)?;
        }
        Ok(())
    }

    fn rename_inner(
        &self,
        old_dir: u32,
        old_name: &[u8],
        new_dir: u32,
        new_name: &[u8],
    ) -> FsResult<Option<u32>> {
        self.ensure_writable()?;
        check_name(old_name)?;
        check_name(new_name)?;
        reject_dots(old_name)?;
        reject_dots(new_name)?;
        // 跨目录移动期间目录树的形状不能变, 否则祖先检查没有意义
        let _tree = (old_dir != new_dir).then(|| self.rename_lock.lock());

        for _ in 0..RELOOKUP_RETRIES {
            let plan = self.rename_plan(old_dir, old_name, new_dir, new_name)?;
            if plan.is_noop() {
                return Ok(None);
            }
            let old_parent = self.locks.get(old_dir);
            let new_parent = self.locks.get(new_dir);
            let source = self.locks.get(plan.src.ino);
            let target = plan.dst.map(|(slot, _)| self.locks.get(slot.ino));
            let mut nodes = vec![&*old_parent, &*new_parent, &*source];
            if let Some(target) = &target {
                nodes.push(&**target);
            }
            let _guard = lock_ordered(&nodes);

            if self.rename_plan(old_dir, old_name, new_dir, new_name)? != plan {
                debug!("rename: entries changed before locking, retrying");
                continue;
            }
            return self.rename_locked(old_dir, new_dir, new_name, &plan);
        }
        warn!(
            "rename {} -> {}: entries keep changing, giving up",
            String::from_utf8_lossy(old_name),
            String::from_utf8_lossy(new_name)
        );
        Err(FsError::NotFound)
    }

    /// 纯校验, 不修改任何东西
    fn rename_plan(
        &self,
        old_dir: u32,
        old_name: &[u8],
        new_dir: u32,
        new_name: &[u8],
    ) -> FsResult<RenamePlan> {
        for dir in [old_dir, new_dir] {
            if !self.inode_kind(dir)?.caps().mutate_entries {
                return Err(FsError::NotDirectory);
            }
        }
        let src = self.dir_lookup(old_dir, old_name)?.ok_or(FsError::NotFound)?;
        let src_inode = self.read_inode(src.ino)?;
        if src_inode.mode == 0 || src_inode.nlink == 0 {
            // 目录项指向的节点已经被回收或正在被回收
            return Err(FsError::NotFound);
        }
        let src_kind = kind_of(src.ino, &src_inode)?;
        let dst = match self.dir_lookup(new_dir, new_name)? {
            Some(slot) => Some((slot, self.inode_kind(slot.ino)?)),
            None => None,
        };
        let plan = RenamePlan { src, src_kind, dst };
        if plan.is_noop() {
            return Ok(plan);
        }

        if let Some((slot, dst_kind)) = dst {
            match (src_kind.is_dir(), dst_kind.is_dir()) {
                (true, false) => return Err(FsError::NotDirectory),
                (false, true) => return Err(FsError::IsDirectory),
                _ => {}
            }
            if dst_kind.is_dir() && !self.dir_is_empty(slot.ino)? {
                return Err(FsError::NotEmpty);
            }
        }
        if src_kind.is_dir() {
            let dotdot = self.dir_dotdot(src.ino)?;
            if dotdot.ino != old_dir {
                return Err(FsError::corrupted(
                    "directory",
                    format!(
                        "directory {} lives in {} but its .. points to {}",
                        src.ino, old_dir, dotdot.ino
                    ),
                ));
            }
            if old_dir != new_dir {
                if dst.is_none() && self.read_inode(new_dir)?.nlink >= UFS_LINK_MAX {
                    return Err(FsError::TooManyLinks);
                }
                if self.is_ancestor(src.ino, new_dir)? {
                    return Err(FsError::Invalid(format!(
                        "cannot move directory {} under itself",
                        src.ino
                    )));
                }
            }
        }
        Ok(plan)
    }

    /// 沿 ".." 从 dir 往上走, 看能否遇到 ancestor
    fn is_ancestor(&self, ancestor: u32, dir: u32) -> FsResult<bool> {
        let mut cur = dir;
        for _ in 0..self.io.geo.max_inodes() {
            if cur == ancestor {
                return Ok(true);
            }
            if cur == ROOT_INO {
                return Ok(false);
            }
            cur = self.dir_dotdot(cur)?.ino;
        }
        Err(FsError::corrupted(
            "directory",
            format!("cycle in .. chain starting at {}", dir),
        ))
    }

    /// 持有全部锁时执行; 返回链接数归零, 需要回收的被替换节点
    fn rename_locked(
        &self,
        old_dir: u32,
        new_dir: u32,
        new_name: &[u8],
        plan: &RenamePlan,
    ) -> FsResult<Option<u32>> {
        let src = plan.src;
        let dtype = plan.src_kind.entry_type();
        match plan.dst {
            Some((slot, _)) => self
                .dir_set_link(new_dir, &slot, src.ino, dtype)
                .map_err(|e| half_done("retargeting the destination entry", e))?,
            None => {
                // 这里失败时还没有改动任何东西
                self.dir_insert(new_dir, new_name, src.ino, dtype)?;
            }
        }
        self.rename_finish(old_dir, new_dir, plan)
            .map_err(|e| half_done("finishing the move", e))
    }

    fn rename_finish(&self, old_dir: u32, new_dir: u32, plan: &RenamePlan) -> FsResult<Option<u32>> {
        let src = plan.src;
        let t = now();
        self.dir_delete(old_dir, &src)?;
        if plan.src_kind.is_dir() {
            if old_dir != new_dir {
                let dotdot = self.dir_dotdot(src.ino)?;
                self.dir_set_link(src.ino, &dotdot, new_dir, EntryType::Directory)?;
            }
            self.modify_inode(old_dir, |i| i.nlink = i.nlink.saturating_sub(1))?;
            self.modify_inode(new_dir, |i| i.nlink += 1)?;
        }
        self.modify_inode(src.ino, |i| i.ctime = t)?;

        let (slot, kind) = match plan.dst {
            Some(dst) => dst,
            None => return Ok(None),
        };
        if kind.is_dir() {
            // 被替换目录的 ".." 不再引用新父目录
            self.modify_inode(new_dir, |i| i.nlink = i.nlink.saturating_sub(1))?;
        }
        let nlink = self.modify_inode(slot.ino, |i| {
            i.nlink = if kind.is_dir() {
                0
            } else {
                i.nlink.saturating_sub(1)
            };
            i.ctime = t;
            i.nlink
        })?;
        debug!(
            "rename: inode {} replaced inode {} (nlink now {})",
            src.ino, slot.ino, nlink
        );
        Ok((nlink == 0).then_some(slot.ino))
    }
}

fn half_done(step: &str, cause: FsError) -> FsError {
    if cause.is_corruption() {
        return cause;
    }
    FsError::corrupted("rename", format!("{} failed after locking: {}", step, cause))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::fs::{
        mkfs::{scratch_volume, FormatParams},
        FsError, InodeKind, UfsFileSystem,
    };

    #[test]
    fn file_moves_between_directories() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let b = root.mkdir("b", 0o755).unwrap();
        let x = a.create("x", InodeKind::File, 0o644).unwrap();
        a.rename("x", &b, "y").unwrap();
        assert!(a.find("x").unwrap().is_none());
        assert_eq!(b.find("y").unwrap().unwrap().ino(), x.ino());
        assert_eq!(x.stat().unwrap().nlink, 1);
        fs.audit_counters().unwrap();
    }

    #[test]
    fn moved_directory_points_at_new_parent() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let b = root.mkdir("b", 0o755).unwrap();
        let d = a.mkdir("d", 0o755).unwrap();
        assert_eq!(a.stat().unwrap().nlink, 3);
        a.rename("d", &b, "d").unwrap();
        assert_eq!(fs.dir_dotdot(d.ino()).unwrap().ino, b.ino());
        assert_eq!(a.stat().unwrap().nlink, 2);
        assert_eq!(b.stat().unwrap().nlink, 3);
        assert_eq!(d.find("..").unwrap().unwrap().ino(), b.ino());
    }

    #[test]
    fn replacing_a_file_reclaims_it() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        root.create("keep", InodeKind::File, 0o644).unwrap();
        let before = fs.totals();
        let src = root.create("src", InodeKind::File, 0o644).unwrap();
        let victim = root.create("dst", InodeKind::File, 0o644).unwrap();
        root.rename("src", &root, "dst").unwrap();
        assert_eq!(root.find("dst").unwrap().unwrap().ino(), src.ino());
        assert!(root.find("src").unwrap().is_none());
        // 被替换的节点已经还回位图
        assert_eq!(fs.read_inode(victim.ino()).unwrap().mode, 0);
        assert_eq!(fs.totals().nifree, before.nifree - 1);
        fs.audit_counters().unwrap();
    }

    #[test]
    fn empty_directory_can_be_replaced() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let before = fs.totals();
        let a = root.mkdir("a", 0o755).unwrap();
        root.mkdir("b", 0o755).unwrap();
        root.rename("a", &root, "b").unwrap();
        assert_eq!(root.find("b").unwrap().unwrap().ino(), a.ino());
        assert_eq!(root.stat().unwrap().nlink, 3);
        assert_eq!(fs.totals().ndir, before.ndir + 1);
        fs.audit_counters().unwrap();
    }

    #[test]
    fn non_empty_destination_leaves_everything_untouched() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let b = root.mkdir("b", 0o755).unwrap();
        let d = a.mkdir("d", 0o755).unwrap();
        let occupied = b.mkdir("d", 0o755).unwrap();
        occupied.create("f", InodeKind::File, 0o644).unwrap();
        let a_entries = a.entries().unwrap();
        let b_entries = b.entries().unwrap();

        assert!(matches!(a.rename("d", &b, "d"), Err(FsError::NotEmpty)));
        assert_eq!(a.entries().unwrap(), a_entries);
        assert_eq!(b.entries().unwrap(), b_entries);
        for ino in [a.ino(), b.ino(), d.ino(), occupied.ino()] {
            assert!(!fs.locks.get(ino).is_locked());
        }
        assert!(!fs.is_read_only());
    }

    #[test]
    fn kind_mismatch_and_self_nesting_are_rejected() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let inner = a.mkdir("inner", 0o755).unwrap();
        root.create("f", InodeKind::File, 0o644).unwrap();
        assert!(matches!(root.rename("a", &root, "f"), Err(FsError::NotDirectory)));
        assert!(matches!(root.rename("f", &root, "a"), Err(FsError::IsDirectory)));
        assert!(matches!(root.rename("a", &inner, "a"), Err(FsError::Invalid(_))));
        assert!(matches!(root.rename("nope", &root, "x"), Err(FsError::NotFound)));
        assert!(matches!(root.rename("..", &root, "x"), Err(FsError::Invalid(_))));
    }

    #[test]
    fn same_inode_is_a_noop() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let f = root.create("f", InodeKind::File, 0o644).unwrap();
        root.link("g", &f).unwrap();
        root.rename("f", &root, "g").unwrap();
        assert_eq!(root.find("f").unwrap().unwrap().ino(), f.ino());
        assert_eq!(f.stat().unwrap().nlink, 2);
    }

    #[test]
    fn crossing_renames_do_not_deadlock() {
        let (_dev, fs) = scratch_volume(FormatParams::default());
        let root = UfsFileSystem::root_inode(&fs);
        let a = root.mkdir("a", 0o755).unwrap();
        let b = root.mkdir("b", 0o755).unwrap();
        a.create("x", InodeKind::File, 0o644).unwrap();
        b.create("y", InodeKind::File, 0o644).unwrap();
        let handles: Vec<_> = [("x", 0), ("y", 1)]
            .into_iter()
            .map(|(name, dir)| {
                let (a, b) = (a.clone(), b.clone());
                thread::spawn(move || {
                    let (mut from, mut to) = if dir == 0 { (a, b) } else { (b, a) };
                    for _ in 0..200 {
                        from.rename(name, &to, name).unwrap();
                        std::mem::swap(&mut from, &mut to);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut names = a.ls().unwrap();
        names.sort();
        assert_eq!(names, vec!["x".to_string()]);
        assert_eq!(b.ls().unwrap(), vec!["y".to_string()]);
        fs.audit_counters().unwrap();
    }
}
