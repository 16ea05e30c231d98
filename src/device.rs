use crate::fs::{BlockDevice, FsResult};
use spin::Mutex;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

pub struct BlockFile(pub Mutex<File>);

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的块的时候，我们必须先 seek 到这个块的开头位置.
// 块的大小由缓冲区长度决定, 读到文件末尾之外会得到 UnexpectedEof.

impl BlockFile {
    /// 打开已有的镜像
    pub fn open(path: impl AsRef<Path>, writable: bool) -> FsResult<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self(Mutex::new(file)))
    }

    /// 新建 (或截断) 一个 len 字节的镜像
    pub fn create(path: impl AsRef<Path>, len: u64) -> FsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self(Mutex::new(file)))
    }
}

impl BlockDevice for BlockFile {
    /// 读取一个块从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> FsResult<()> {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start((block_id * buf.len()) as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// 写一个块到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) -> FsResult<()> {
        let mut file = self.0.lock();
        file.seek(SeekFrom::Start((block_id * buf.len()) as u64))?;
        file.write_all(buf)?;
        Ok(())
    }
}
