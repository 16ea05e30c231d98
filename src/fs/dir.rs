//! 目录
//!
//! 目录内容是一串 512 字节的块 (DIRBLKSIZ), 每块被一条条变长记录恰好铺满:
//!
//! ```text
//! +--------+--------+-------------------+----------------------+
//! | ino:32 | len:16 | type:8 | namlen:8 | name ... \0 padding  |   44BSD
//! | ino:32 | len:16 | namlen:16         | name ... \0 padding  |   旧格式
//! +--------+--------+-------------------+----------------------+
//! ```
//!
//! ino 为 0 的记录是墓碑, 只占位不代表任何名字. 一块内所有记录的 reclen 之和恰好是 512,
//! 记录永远不会跨块. 插入时优先复用墓碑, 其次拆分一条有富余的活记录, 都不行才给目录追加一块.
//! 删除时把记录并入前一条 (块内第一条则只清零 ino).
//!
//! 读出的每条记录都要校验, 不合法的块整体视为损坏.

use log::{debug, warn};

use super::{
    dialect::DirFormat,
    endian::Codec,
    inode::{allocated_frags, kind_of},
    layout::{DiskInode, NDADDR},
    locks::{lock_ordered, InodeLock},
    ufs::UfsFileSystem,
    FsError, FsResult, DIRBLKSIZ, MAXNAMLEN,
};

/// 记录头部长度
pub const DIRENT_HEADER: usize = 8;

/// 名字长度为 namlen 的记录至少占用的字节数 (含结尾的 0, 按 4 字节对齐)
pub const fn dirsiz(namlen: usize) -> usize {
    (DIRENT_HEADER + namlen + 1 + 3) & !3
}

/// 目录项中记录的文件类型 (d_type)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryType {
    Unknown,
    Fifo,
    CharDevice,
    Directory,
    BlockDevice,
    Regular,
    Symlink,
    Socket,
    Whiteout,
}

impl EntryType {
    pub fn from_dt(dt: u8) -> Self {
        match dt {
            1 => Self::Fifo,
            2 => Self::CharDevice,
            4 => Self::Directory,
            6 => Self::BlockDevice,
            8 => Self::Regular,
            10 => Self::Symlink,
            12 => Self::Socket,
            14 => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    pub fn to_dt(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Fifo => 1,
            Self::CharDevice => 2,
            Self::Directory => 4,
            Self::BlockDevice => 6,
            Self::Regular => 8,
            Self::Symlink => 10,
            Self::Socket => 12,
            Self::Whiteout => 14,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirentHeader {
    pub ino: u32,
    pub reclen: u16,
    pub namlen: u16,
    pub dtype: EntryType,
}

/// 单个 512 字节目录块的编解码
#[derive(Clone, Copy, Debug)]
pub struct RecordCodec {
    format: DirFormat,
    codec: Codec,
    /// 合法索引节点号的上界 (ncg * ipg)
    max_ino: u32,
}

impl RecordCodec {
    pub fn new(format: DirFormat, codec: Codec, max_ino: u32) -> Self {
        Self {
            format,
            codec,
            max_ino,
        }
    }

    pub fn header(&self, chunk: &[u8], off: usize) -> DirentHeader {
        let ino = self.codec.get_u32(chunk, off);
        let reclen = self.codec.get_u16(chunk, off + 4);
        let (namlen, dtype) = match self.format {
            DirFormat::Bsd44 => (chunk[off + 7] as u16, EntryType::from_dt(chunk[off + 6])),
            DirFormat::Old => (self.codec.get_u16(chunk, off + 6), EntryType::Unknown),
        };
        DirentHeader {
            ino,
            reclen,
            namlen,
            dtype,
        }
    }

    fn put_header(&self, chunk: &mut [u8], off: usize, h: &DirentHeader) {
        self.codec.put_u32(chunk, off, h.ino);
        self.codec.put_u16(chunk, off + 4, h.reclen);
        match self.format {
            DirFormat::Bsd44 => {
                chunk[off + 6] = h.dtype.to_dt();
                chunk[off + 7] = h.namlen as u8;
            }
            DirFormat::Old => self.codec.put_u16(chunk, off + 6, h.namlen),
        }
    }

    fn set_reclen(&self, chunk: &mut [u8], off: usize, reclen: usize) {
        self.codec.put_u16(chunk, off + 4, reclen as u16);
    }

    pub fn name<'a>(&self, chunk: &'a [u8], off: usize, h: &DirentHeader) -> &'a [u8] {
        &chunk[off + DIRENT_HEADER..off + DIRENT_HEADER + h.namlen as usize]
    }

    /// 校验块内 off 处的记录; base 是这一块在目录中的字节偏移, 只用于报错
    pub fn check(&self, chunk: &[u8], off: usize, base: u64) -> FsResult<DirentHeader> {
        let bad = |why: &str| {
            Err(FsError::corrupted(
                "directory entry",
                format!("{} at offset {}", why, base + off as u64),
            ))
        };
        if off + DIRENT_HEADER > DIRBLKSIZ {
            return bad("truncated header");
        }
        let h = self.header(chunk, off);
        let reclen = h.reclen as usize;
        if reclen < dirsiz(1) {
            return bad("directory entry too small");
        }
        if reclen % 4 != 0 {
            return bad("misaligned directory entry");
        }
        if h.namlen as usize > MAXNAMLEN {
            return bad("name too long");
        }
        if reclen < dirsiz(h.namlen as usize) {
            return bad("rec_len is too small for name_len");
        }
        if off + reclen > DIRBLKSIZ {
            return bad("directory entry across blocks");
        }
        if h.ino >= self.max_ino {
            return bad("inode out of bounds");
        }
        Ok(h)
    }

    /// 校验并列出整块的记录 (含墓碑)
    pub fn records(&self, chunk: &[u8], base: u64) -> FsResult<Vec<(usize, DirentHeader)>> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < DIRBLKSIZ {
            let h = self.check(chunk, off, base)?;
            out.push((off, h));
            off += h.reclen as usize;
        }
        Ok(out)
    }

    pub fn find(
        &self,
        chunk: &[u8],
        base: u64,
        name: &[u8],
    ) -> FsResult<Option<(usize, DirentHeader)>> {
        Ok(self
            .records(chunk, base)?
            .into_iter()
            .find(|(off, h)| h.ino != 0 && self.name(chunk, *off, h) == name))
    }

    /// 找一个能容纳 namlen 长名字的位置: 足够大的墓碑, 或有足够富余的活记录
    pub fn find_slot(
        &self,
        chunk: &[u8],
        base: u64,
        namlen: usize,
    ) -> FsResult<Option<(usize, DirentHeader)>> {
        let need = dirsiz(namlen);
        Ok(self.records(chunk, base)?.into_iter().find(|(_, h)| {
            let reclen = h.reclen as usize;
            if h.ino == 0 {
                reclen >= need
            } else {
                reclen >= dirsiz(h.namlen as usize) + need
            }
        }))
    }

    /// 在 find_slot 找到的位置上写入新记录, 返回新记录在块内的偏移
    pub fn place(
        &self,
        chunk: &mut [u8],
        off: usize,
        slot: &DirentHeader,
        name: &[u8],
        ino: u32,
        dtype: EntryType,
    ) -> usize {
        let (at, reclen) = if slot.ino != 0 {
            let own = dirsiz(slot.namlen as usize);
            self.set_reclen(chunk, off, own);
            (off + own, slot.reclen as usize - own)
        } else {
            (off, slot.reclen as usize)
        };
        self.write_record(chunk, at, reclen, name, ino, dtype);
        at
    }

    fn write_record(
        &self,
        chunk: &mut [u8],
        at: usize,
        reclen: usize,
        name: &[u8],
        ino: u32,
        dtype: EntryType,
    ) {
        let h = DirentHeader {
            ino,
            reclen: reclen as u16,
            namlen: name.len() as u16,
            dtype,
        };
        self.put_header(chunk, at, &h);
        let start = at + DIRENT_HEADER;
        chunk[start..start + name.len()].copy_from_slice(name);
        for b in &mut chunk[start + name.len()..at + dirsiz(name.len())] {
            *b = 0;
        }
    }

    /// 删除 off 处的记录: 并入前一条, 块内第一条则清零 ino
    pub fn remove(&self, chunk: &mut [u8], off: usize, base: u64) -> FsResult<()> {
        let mut prev = None;
        let mut at = 0;
        loop {
            if at > off || at >= DIRBLKSIZ {
                return Err(FsError::corrupted(
                    "directory entry",
                    format!("no record boundary at offset {}", base + off as u64),
                ));
            }
            let h = self.check(chunk, at, base)?;
            if at == off {
                if let Some(p) = prev {
                    self.set_reclen(chunk, p, off + h.reclen as usize - p);
                }
                self.codec.put_u32(chunk, off, 0);
                return Ok(());
            }
            prev = Some(at);
            at += h.reclen as usize;
        }
    }

    /// 改写 off 处记录指向的索引节点与类型 (名字不变)
    pub fn retarget(&self, chunk: &mut [u8], off: usize, ino: u32, dtype: EntryType) {
        let mut h = self.header(chunk, off);
        h.ino = ino;
        h.dtype = dtype;
        self.put_header(chunk, off, &h);
    }

    /// 一整块空闲: 单个墓碑
    pub fn init_chunk(&self, chunk: &mut [u8]) {
        for b in chunk[..DIRBLKSIZ].iter_mut() {
            *b = 0;
        }
        self.put_header(
            chunk,
            0,
            &DirentHeader {
                ino: 0,
                reclen: DIRBLKSIZ as u16,
                namlen: 0,
                dtype: EntryType::Unknown,
            },
        );
    }

    /// 新目录的第一块: "." 和 ".."
    pub fn make_empty(&self, chunk: &mut [u8], self_ino: u32, parent_ino: u32) {
        self.init_chunk(chunk);
        let dot = dirsiz(1);
        self.write_record(chunk, 0, dot, b".", self_ino, EntryType::Directory);
        self.write_record(chunk, dot, DIRBLKSIZ - dot, b"..", parent_ino, EntryType::Directory);
    }

    /// 目录是否只剩 "." 和 ".."
    pub fn chunk_is_empty(&self, chunk: &[u8], base: u64, self_ino: u32) -> FsResult<bool> {
        for (off, h) in self.records(chunk, base)? {
            if h.ino == 0 {
                continue;
            }
            match self.name(chunk, off, &h) {
                b"." if h.ino == self_ino => {}
                b".." => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// 目录中一条记录的位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirSlot {
    /// 记录在目录中的字节偏移
    pub offset: u64,
    pub ino: u32,
    pub dtype: EntryType,
}

/// 遍历游标; 版本号与目录当前版本不同时需要重新对齐到记录边界
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirCursor {
    pub pos: u64,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirItem {
    pub name: Vec<u8>,
    pub ino: u32,
    pub dtype: EntryType,
    pub offset: u64,
}

impl DirItem {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

pub fn check_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.len() > MAXNAMLEN {
        return Err(FsError::InvalidName(String::from_utf8_lossy(name).into_owned()));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::InvalidName(String::from_utf8_lossy(name).into_owned()));
    }
    Ok(())
}

/// 以下方法的调用者负责持有目录的锁 (修改类) 或容忍并发修改 (只读遍历)
impl UfsFileSystem {
    pub fn record_codec(&self) -> RecordCodec {
        RecordCodec::new(
            self.io.flavor.dir_format(),
            self.io.flavor.codec,
            self.io.geo.max_inodes(),
        )
    }

    fn read_dir_inode(&self, dir: u32) -> FsResult<DiskInode> {
        let inode = self.read_inode(dir)?;
        if !kind_of(dir, &inode)?.caps().iterate {
            return Err(FsError::NotDirectory);
        }
        if inode.size % DIRBLKSIZ as u64 != 0 {
            return Err(FsError::corrupted(
                "directory",
                format!("directory {} size {} is not a multiple of {}", dir, inode.size, DIRBLKSIZ),
            ));
        }
        Ok(inode)
    }

    /// 第 idx 个目录块所在的碎片地址和碎片内偏移
    fn chunk_location(&self, dir: u32, inode: &DiskInode, idx: u64) -> FsResult<(u32, usize)> {
        let geo = &self.io.geo;
        let byte = idx * DIRBLKSIZ as u64;
        let lblk = (byte >> geo.bshift) as usize;
        if lblk >= NDADDR || inode.db[lblk] == 0 {
            return Err(FsError::corrupted(
                "directory",
                format!("directory {} has a hole at offset {}", dir, byte),
            ));
        }
        let in_block = (byte as u32) & (geo.bsize - 1);
        Ok((inode.db[lblk] + (in_block >> geo.fshift), (in_block & (geo.fsize - 1)) as usize))
    }

    fn read_chunk(&self, dir: u32, inode: &DiskInode, idx: u64) -> FsResult<Vec<u8>> {
        let (frag, off) = self.chunk_location(dir, inode, idx)?;
        Ok(self
            .io
            .cache
            .get_block_cache(frag as usize)?
            .lock()
            .read(off, |bytes| bytes[..DIRBLKSIZ].to_vec()))
    }

    fn modify_chunk<V>(
        &self,
        dir: u32,
        inode: &DiskInode,
        idx: u64,
        f: impl FnOnce(&mut [u8]) -> FsResult<V>,
    ) -> FsResult<V> {
        let (frag, off) = self.chunk_location(dir, inode, idx)?;
        let v = self
            .io
            .cache
            .get_block_cache(frag as usize)?
            .lock()
            .modify(off, |bytes| f(&mut bytes[..DIRBLKSIZ]))?;
        self.io.settle(frag)?;
        Ok(v)
    }

    fn dir_lock(&self, dir: u32) -> std::sync::Arc<InodeLock> {
        self.locks.get(dir)
    }

    /// 按名字查找
    pub fn dir_lookup(&self, dir: u32, name: &[u8]) -> FsResult<Option<DirSlot>> {
        let inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        for idx in 0..inode.size / DIRBLKSIZ as u64 {
            let base = idx * DIRBLKSIZ as u64;
            let chunk = self.read_chunk(dir, &inode, idx)?;
            if let Some((off, h)) = rc.find(&chunk, base, name)? {
                return Ok(Some(DirSlot {
                    offset: base + off as u64,
                    ino: h.ino,
                    dtype: h.dtype,
                }));
            }
        }
        Ok(None)
    }

    /// 插入一条新目录项
    ///
    /// 先完整查一遍重名, 重名则不做任何修改直接返回 Exists.
    pub fn dir_insert(&self, dir: u32, name: &[u8], ino: u32, dtype: EntryType) -> FsResult<DirSlot> {
        check_name(name)?;
        if self.dir_lookup(dir, name)?.is_some() {
            return Err(FsError::Exists);
        }
        let mut inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        let nchunks = inode.size / DIRBLKSIZ as u64;
        for idx in 0..nchunks {
            let base = idx * DIRBLKSIZ as u64;
            let chunk = self.read_chunk(dir, &inode, idx)?;
            if let Some((off, slot)) = rc.find_slot(&chunk, base, name.len())? {
                let at = self.modify_chunk(dir, &inode, idx, |chunk| {
                    Ok(rc.place(chunk, off, &slot, name, ino, dtype))
                })?;
                return self.finish_insert(dir, base + at as u64, ino, dtype);
            }
        }

        // 追加一块
        let geo = &self.io.geo;
        let base = inode.size;
        if base + DIRBLKSIZ as u64 > geo.max_dir_size() {
            return Err(FsError::DirectoryFull);
        }
        let lblk = (base >> geo.bshift) as usize;
        if inode.db[lblk] == 0 {
            let addr = self.alloc_block(geo.ino_to_cg(dir))?;
            inode.db[lblk] = addr;
            inode.blocks += geo.bsize / 512;
            debug!("dir {}: grow into block {} at frag {}", dir, lblk, addr);
        } else {
            // 尾部只有几个碎片且装不下新的一块: 换成整块, 把旧碎片的内容搬过去
            let have = allocated_frags(geo, &inode, lblk);
            let end = (base & (geo.bsize as u64 - 1)) as u32 + DIRBLKSIZ as u32;
            let need = (end + geo.fsize - 1) >> geo.fshift;
            if have < need {
                let old = inode.db[lblk];
                let addr = self.alloc_block(geo.ino_to_cg(dir))?;
                let data = self.io.read_frags(old, (have * geo.fsize) as usize)?;
                self.io.write_frags(addr, &data)?;
                self.free_frags(old, have)?;
                inode.db[lblk] = addr;
                inode.blocks += (geo.frag - have) * (geo.fsize / 512);
                debug!(
                    "dir {}: moved {} tail frags from {} to block at {}",
                    dir, have, old, addr
                );
            }
        }
        inode.size += DIRBLKSIZ as u64;
        self.write_inode(dir, &inode)?;
        let at = self.modify_chunk(dir, &inode, nchunks, |chunk| {
            rc.init_chunk(chunk);
            let slot = rc.header(chunk, 0);
            Ok(rc.place(chunk, 0, &slot, name, ino, dtype))
        })?;
        self.finish_insert(dir, base + at as u64, ino, dtype)
    }

    fn finish_insert(&self, dir: u32, offset: u64, ino: u32, dtype: EntryType) -> FsResult<DirSlot> {
        self.touch_dir(dir)?;
        Ok(DirSlot { offset, ino, dtype })
    }

    /// 目录内容变了: 递增版本号, 更新 mtime/ctime
    fn touch_dir(&self, dir: u32) -> FsResult<()> {
        self.dir_lock(dir).bump();
        let t = super::ufs::now();
        self.modify_inode(dir, |inode| {
            inode.mtime = t;
            inode.ctime = t;
        })
    }

    fn slot_chunk(&self, slot: &DirSlot) -> (u64, usize) {
        (
            slot.offset / DIRBLKSIZ as u64,
            (slot.offset % DIRBLKSIZ as u64) as usize,
        )
    }

    /// 删除 slot 处的目录项; slot 必须仍然指向同一个索引节点
    pub fn dir_delete(&self, dir: u32, slot: &DirSlot) -> FsResult<()> {
        let inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        let (idx, off) = self.slot_chunk(slot);
        if slot.offset >= inode.size {
            return Err(FsError::corrupted(
                "directory",
                format!("entry offset {} beyond directory size {}", slot.offset, inode.size),
            ));
        }
        self.modify_chunk(dir, &inode, idx, |chunk| {
            let h = rc.check(chunk, off, idx * DIRBLKSIZ as u64)?;
            if h.ino != slot.ino {
                return Err(FsError::NotFound);
            }
            rc.remove(chunk, off, idx * DIRBLKSIZ as u64)
        })?;
        self.touch_dir(dir)
    }

    /// 让 slot 处的目录项改指 ino
    pub fn dir_set_link(&self, dir: u32, slot: &DirSlot, ino: u32, dtype: EntryType) -> FsResult<()> {
        let inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        let (idx, off) = self.slot_chunk(slot);
        self.modify_chunk(dir, &inode, idx, |chunk| {
            let h = rc.check(chunk, off, idx * DIRBLKSIZ as u64)?;
            if h.ino != slot.ino {
                return Err(FsError::NotFound);
            }
            rc.retarget(chunk, off, ino, dtype);
            Ok(())
        })?;
        self.touch_dir(dir)
    }

    pub fn dir_is_empty(&self, dir: u32) -> FsResult<bool> {
        let inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        for idx in 0..inode.size / DIRBLKSIZ as u64 {
            let chunk = self.read_chunk(dir, &inode, idx)?;
            if !rc.chunk_is_empty(&chunk, idx * DIRBLKSIZ as u64, dir)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// ".." 记录: 第一块的第二条
    pub fn dir_dotdot(&self, dir: u32) -> FsResult<DirSlot> {
        let inode = self.read_dir_inode(dir)?;
        let rc = self.record_codec();
        if inode.size == 0 {
            return Err(FsError::corrupted(
                "directory",
                format!("directory {} is empty", dir),
            ));
        }
        let chunk = self.read_chunk(dir, &inode, 0)?;
        let dot = rc.check(&chunk, 0, 0)?;
        let off = dot.reclen as usize;
        let dotdot = rc.check(&chunk, off, 0)?;
        if rc.name(&chunk, 0, &dot) != b"." || rc.name(&chunk, off, &dotdot) != b".." {
            return Err(FsError::corrupted(
                "directory",
                format!("directory {} does not start with . and ..", dir),
            ));
        }
        Ok(DirSlot {
            offset: off as u64,
            ino: dotdot.ino,
            dtype: dotdot.dtype,
        })
    }

    /// 给新目录分配第一块并写入 "." 和 ".."
    pub fn dir_make_empty(&self, dir: u32, parent: u32) -> FsResult<()> {
        let geo = &self.io.geo;
        let addr = self.alloc_block(geo.ino_to_cg(dir))?;
        let mut inode = self.read_inode(dir)?;
        inode.db[0] = addr;
        inode.blocks = geo.bsize / 512;
        inode.size = DIRBLKSIZ as u64;
        self.write_inode(dir, &inode)?;
        let rc = self.record_codec();
        self.modify_chunk(dir, &inode, 0, |chunk| {
            rc.make_empty(chunk, dir, parent);
            Ok(())
        })
    }

    /// 从游标处开始遍历目录
    pub fn dir_iter(&self, dir: u32, cursor: DirCursor) -> DirIter<'_> {
        DirIter {
            fs: self,
            dir,
            lock: self.dir_lock(dir),
            cursor,
            finished: false,
        }
    }
}

pub struct DirIter<'a> {
    fs: &'a UfsFileSystem,
    dir: u32,
    lock: std::sync::Arc<InodeLock>,
    cursor: DirCursor,
    finished: bool,
}

impl DirIter<'_> {
    /// 当前游标, 可以保存下来稍后继续遍历
    pub fn cursor(&self) -> DirCursor {
        self.cursor
    }

    /// 目录变过之后, 游标可能落在某条记录中间: 从块首走到 pos 之后的第一个边界.
    /// 途经的每条记录都要校验
    fn realign(&self, chunk: &[u8], within: usize, base: u64) -> FsResult<usize> {
        let rc = self.fs.record_codec();
        let mut at = 0;
        while at < within {
            at += rc.check(chunk, at, base)?.reclen as usize;
        }
        Ok(at)
    }

    /// 跳过当前块并把错误交给卷的损坏检查
    fn skip_chunk(&mut self, base: u64, e: FsError) -> FsResult<DirItem> {
        self.cursor.pos = base + DIRBLKSIZ as u64;
        self.fs.check(Err(e))
    }
}

impl Iterator for DirIter<'_> {
    type Item = FsResult<DirItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let rc = self.fs.record_codec();
        let lock = std::sync::Arc::clone(&self.lock);
        loop {
            // 写者先改块再递增版本号, 两者都在目录锁下完成;
            // 块内容和版本号必须在同一次持锁中取出
            let guard = lock_ordered(&[&*lock]);
            let inode = match self.fs.read_dir_inode(self.dir) {
                Ok(inode) => inode,
                Err(e) => {
                    drop(guard);
                    self.finished = true;
                    return Some(self.fs.check(Err(e)));
                }
            };
            if self.cursor.pos >= inode.size {
                return None;
            }
            let idx = self.cursor.pos / DIRBLKSIZ as u64;
            let base = idx * DIRBLKSIZ as u64;
            let chunk = self.fs.read_chunk(self.dir, &inode, idx);
            let version = lock.version();
            drop(guard);

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return Some(self.skip_chunk(base, e)),
            };
            let mut within = (self.cursor.pos - base) as usize;
            if version != self.cursor.version {
                within = match self.realign(&chunk, within, base) {
                    Ok(at) => at,
                    Err(e) => {
                        warn!("dir {}: cannot realign cursor in block at {}", self.dir, base);
                        return Some(self.skip_chunk(base, e));
                    }
                };
                self.cursor.version = version;
            }
            if within >= DIRBLKSIZ {
                self.cursor.pos = base + DIRBLKSIZ as u64;
                continue;
            }
            let h = match rc.check(&chunk, within, base) {
                Ok(h) => h,
                Err(e) => {
                    warn!("dir {}: skipping damaged block at {}", self.dir, base);
                    return Some(self.skip_chunk(base, e));
                }
            };
            self.cursor.pos = base + (within + h.reclen as usize) as u64;
            if h.ino != 0 {
                return Some(Ok(DirItem {
                    name: rc.name(&chunk, within, &h).to_vec(),
                    ino: h.ino,
                    dtype: h.dtype,
                    offset: base + within as u64,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::endian::ByteOrder;
    use rand::{seq::SliceRandom, Rng};
    use std::collections::HashMap;

    fn codec(format: DirFormat) -> RecordCodec {
        RecordCodec::new(format, Codec::new(ByteOrder::Big), 1024)
    }

    fn live(rc: &RecordCodec, chunk: &[u8]) -> Vec<(String, u32)> {
        rc.records(chunk, 0)
            .unwrap()
            .into_iter()
            .filter(|(_, h)| h.ino != 0)
            .map(|(off, h)| (String::from_utf8_lossy(rc.name(chunk, off, &h)).into_owned(), h.ino))
            .collect()
    }

    fn insert(rc: &RecordCodec, chunk: &mut [u8], name: &str, ino: u32) -> Option<usize> {
        let (off, slot) = rc.find_slot(chunk, 0, name.len()).unwrap()?;
        Some(rc.place(chunk, off, &slot, name.as_bytes(), ino, EntryType::Regular))
    }

    #[test]
    fn record_sizes() {
        assert_eq!(dirsiz(1), 12);
        assert_eq!(dirsiz(2), 12);
        assert_eq!(dirsiz(3), 12);
        assert_eq!(dirsiz(4), 16);
        assert_eq!(dirsiz(255), 264);
    }

    #[test]
    fn fresh_directory_layout() {
        let rc = codec(DirFormat::Bsd44);
        let mut chunk = [0u8; DIRBLKSIZ];
        rc.make_empty(&mut chunk, 5, 2);
        let recs = rc.records(&chunk, 0).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].1.reclen, 12);
        assert_eq!(recs[1].1.reclen, 500);
        assert_eq!(recs[1].1.dtype, EntryType::Directory);
        assert!(rc.chunk_is_empty(&chunk, 0, 5).unwrap());
        // "." 指向别处就不算空
        assert!(!rc.chunk_is_empty(&chunk, 0, 6).unwrap());
    }

    #[test]
    fn insert_splits_dotdot_then_reuses_tombstone_whole() {
        let rc = codec(DirFormat::Bsd44);
        let mut chunk = [0u8; DIRBLKSIZ];
        rc.make_empty(&mut chunk, 5, 2);
        let at = insert(&rc, &mut chunk, "foo", 9).unwrap();
        assert_eq!(at, 24);
        let recs = rc.records(&chunk, 0).unwrap();
        assert_eq!(recs[1].1.reclen, 12);
        assert_eq!(recs[2].1.reclen, 488);

        rc.remove(&mut chunk, 24, 0).unwrap();
        let recs = rc.records(&chunk, 0).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[1].1.reclen, 500);
        assert_eq!(live(&rc, &chunk), vec![(".".into(), 5), ("..".into(), 2)]);
    }

    #[test]
    fn first_record_becomes_tombstone_and_is_reused() {
        let rc = codec(DirFormat::Old);
        let mut chunk = [0u8; DIRBLKSIZ];
        rc.init_chunk(&mut chunk);
        insert(&rc, &mut chunk, "alpha", 3).unwrap();
        insert(&rc, &mut chunk, "b", 4).unwrap();
        rc.remove(&mut chunk, 0, 0).unwrap();
        let recs = rc.records(&chunk, 0).unwrap();
        assert_eq!(recs[0].1.ino, 0);
        assert_eq!(recs[0].1.reclen as usize, dirsiz(5));
        // 墓碑够大就整个复用, 不拆分
        assert_eq!(insert(&rc, &mut chunk, "gamma", 6), Some(0));
        assert_eq!(rc.records(&chunk, 0).unwrap()[0].1.reclen as usize, dirsiz(5));
        assert_eq!(rc.header(&chunk, 0).dtype, EntryType::Unknown);
    }

    #[test]
    fn validation_rejects_bad_records() {
        let rc = codec(DirFormat::Bsd44);
        let mut chunk = [0u8; DIRBLKSIZ];
        rc.make_empty(&mut chunk, 5, 2);
        let mut bad = chunk;
        Codec::new(ByteOrder::Big).put_u16(&mut bad, 4, 14);
        assert!(rc.records(&bad, 0).unwrap_err().is_corruption());
        let mut bad = chunk;
        Codec::new(ByteOrder::Big).put_u16(&mut bad, 12 + 4, 504);
        assert!(rc.records(&bad, 0).unwrap_err().is_corruption());
        let mut bad = chunk;
        Codec::new(ByteOrder::Big).put_u32(&mut bad, 12, 4096);
        assert!(rc.records(&bad, 0).unwrap_err().is_corruption());
        let mut bad = chunk;
        bad[7] = 9;
        assert!(rc.records(&bad, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn chunk_full_of_long_names() {
        let rc = codec(DirFormat::Bsd44);
        let mut chunk = [0u8; DIRBLKSIZ];
        rc.make_empty(&mut chunk, 5, 2);
        let name = "n".repeat(100);
        let mut count = 0;
        while insert(&rc, &mut chunk, &format!("{}{}", name, count), 10 + count).is_some() {
            count += 1;
        }
        // (512 - 24) / dirsiz(101) = 488 / 112 = 4
        assert_eq!(count, 4);
    }

    #[test]
    fn random_inserts_and_deletes_keep_chunk_tiled() {
        let mut rng = rand::thread_rng();
        for format in [DirFormat::Bsd44, DirFormat::Old] {
            let rc = codec(format);
            let mut chunk = [0u8; DIRBLKSIZ];
            rc.make_empty(&mut chunk, 5, 2);
            let mut model: HashMap<String, u32> = HashMap::new();
            for step in 0..2000u32 {
                if rng.gen_bool(0.6) {
                    let len = rng.gen_range(1..40);
                    let name: String = (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
                    if model.contains_key(&name) {
                        continue;
                    }
                    let ino = 10 + step % 900;
                    if insert(&rc, &mut chunk, &name, ino).is_some() {
                        model.insert(name, ino);
                    }
                } else if let Some(name) = model.keys().cloned().collect::<Vec<_>>().choose(&mut rng) {
                    let (off, _) = rc.find(&chunk, 0, name.as_bytes()).unwrap().unwrap();
                    rc.remove(&mut chunk, off, 0).unwrap();
                    model.remove(name);
                }
                let recs = rc.records(&chunk, 0).unwrap();
                let sum: usize = recs.iter().map(|(_, h)| h.reclen as usize).sum();
                assert_eq!(sum, DIRBLKSIZ);
                let mut found = live(&rc, &chunk);
                found.retain(|(n, _)| n != "." && n != "..");
                assert_eq!(found.len(), model.len());
                for (n, ino) in found {
                    assert_eq!(model.get(&n), Some(&ino));
                }
            }
        }
    }

    #[test]
    fn stale_cursor_over_damaged_record_reports_corruption() {
        use crate::fs::mkfs::{scratch_volume, FormatParams};
        let (_mem, fs) = scratch_volume(FormatParams::default());
        let root = crate::fs::ROOT_INO;
        let inode = fs.read_dir_inode(root).unwrap();
        let rc = fs.record_codec();
        // "." 吞掉几乎整块, 剩下的 4 字节放不下记录头
        fs.modify_chunk(root, &inode, 0, |chunk| {
            rc.set_reclen(chunk, 0, 508);
            Ok(())
        })
        .unwrap();

        let mut iter = fs.dir_iter(root, DirCursor { pos: 510, version: 0 });
        match iter.next() {
            Some(Err(e)) => assert!(e.is_corruption(), "{}", e),
            other => panic!("expected corruption, got {:?}", other),
        }
        assert!(fs.is_read_only());
        assert!(iter.next().is_none());
    }

    #[test]
    fn names_are_checked() {
        assert!(check_name(b"ok").is_ok());
        assert!(check_name(b"").is_err());
        assert!(check_name(b"a/b").is_err());
        assert!(check_name(&[b'x'; 256]).is_err());
        assert!(check_name(&[b'x'; 255]).is_ok());
    }
}
