//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这两个方法.
//! 块缓存层和挂载试探会调用这两个方法.
//!
//! 与固定块大小的设备不同, 这里块的大小由缓冲区长度决定:
//! 编号为 block_id 的块位于字节偏移 block_id * buf.len() 处.
//! 挂载试探阶段会用不同的块大小读同一个超级块.

use std::any::Any;

use spin::Mutex;

use super::FsResult;

pub trait BlockDevice: Send + Sync + Any {
    /// read_block 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> FsResult<()>;

    /// write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的块
    fn write_block(&self, block_id: usize, buf: &[u8]) -> FsResult<()>;
}

/// 内存中的块设备, 测试和临时镜像使用
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
}

impl MemDevice {
    pub fn new(bytes: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; bytes]),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// 整个设备内容的拷贝
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn range(&self, block_id: usize, len: usize) -> FsResult<(usize, usize)> {
        let start = block_id * len;
        let end = start + len;
        if end > self.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("block {} (size {}) beyond end of device", block_id, len),
            )
            .into());
        }
        Ok((start, end))
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> FsResult<()> {
        let (start, end) = self.range(block_id, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[start..end]);
        Ok(())
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> FsResult<()> {
        let (start, end) = self.range(block_id, buf.len())?;
        self.data.lock()[start..end].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_follows_buffer() {
        let dev = MemDevice::new(4096);
        dev.write_block(1, &[7u8; 1024]).unwrap();
        let mut small = [0u8; 512];
        dev.read_block(2, &mut small).unwrap();
        assert!(small.iter().all(|b| *b == 7));
        dev.read_block(1, &mut small).unwrap();
        assert!(small.iter().all(|b| *b == 0));
    }

    #[test]
    fn out_of_range_is_io_error() {
        let dev = MemDevice::new(1024);
        let mut buf = [0u8; 1024];
        let err = dev.read_block(1, &mut buf).unwrap_err();
        assert_eq!(err.errno(), 5);
    }
}
