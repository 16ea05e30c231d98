//! 块缓存层: 在内存中缓存磁盘块的数据, 避免频繁读写磁盘
//!
//! 先通过 read_block 将一个块上的数据从磁盘读到内存中的一个缓冲区 [`BlockCache`] 中,
//! 后续对这个数据块的大部分访问就可以在内存中完成了.
//! 如果缓冲区中的内容被修改了, 那么之后还需要通过 write_block 将缓冲区中的内容写回到磁盘块中.
//!
//! 每个挂载的卷拥有一个自己的 [`BlockCacheManager`] (而不是全局的), 这样同一进程内可以同时挂载多个卷.
//! 缓存的块大小等于卷的碎片大小, 块编号即碎片地址; CD 风格卷的起点偏移 base 在这里统一加上.

use std::{collections::VecDeque, sync::Arc};

use log::{debug, error};
use spin::Mutex;

use super::{BlockDevice, FsResult};

/// Cached block inside memory
pub struct BlockCache {
    /// 位于内存中的缓冲区, 大小恰好为一个块
    cache: Vec<u8>,
    /// 设备上的物理块编号 (已经加上 base)
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    /// 从磁盘载入内存缓存之后, 有没有被修改过
    modified: bool,
}

impl BlockCache {
    /// 创建一个 BlockCache: 这将触发一次 read_block
    pub fn new(
        block_id: usize,
        block_size: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> FsResult<Self> {
        let mut cache = vec![0u8; block_size];
        block_device.read_block(block_id, &mut cache)?;
        Ok(Self {
            cache,
            block_id,
            block_device,
            modified: false,
        })
    }

    /// 在偏移量 offset 处开始的字节切片上执行闭包 f
    pub fn read<V>(&self, offset: usize, f: impl FnOnce(&[u8]) -> V) -> V {
        f(&self.cache[offset..])
    }

    /// 同 read, 但缓冲区会被标记为已修改, 之后需要写回
    pub fn modify<V>(&mut self, offset: usize, f: impl FnOnce(&mut [u8]) -> V) -> V {
        self.modified = true;
        f(&mut self.cache[offset..])
    }

    pub fn sync(&mut self) -> FsResult<()> {
        if self.modified {
            self.block_device.write_block(self.block_id, &self.cache)?;
            self.modified = false;
        }
        Ok(())
    }
}

impl Drop for BlockCache {
    /// If modified, write back to disk when dropped.
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            error!("block {}: write-back on drop failed: {}", self.block_id, e);
        }
    }
}

/// 类 FIFO 的块缓存管理器
///
/// 要替换时从队头遍历到队尾, 找到第一个强引用计数恰好为 1 的块缓存 (即除了管理器以外没人在用) 并将其替换出去.
pub struct BlockCacheManager {
    block_device: Arc<dyn BlockDevice>,
    block_size: usize,
    /// 以块为单位的卷起点
    base: usize,
    capacity: usize,
    queue: Mutex<VecDeque<(usize, Arc<Mutex<BlockCache>>)>>,
}

impl BlockCacheManager {
    pub fn new(
        block_device: Arc<dyn BlockDevice>,
        block_size: usize,
        base: usize,
        capacity: usize,
    ) -> Self {
        Self {
            block_device,
            block_size,
            base,
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// 尝试从块缓存管理器中获取一个编号为 block_id 的块的块缓存,
    /// 如果找不到, 会从磁盘读取到内存中, 还有可能会发生缓存替换
    pub fn get_block_cache(&self, block_id: usize) -> FsResult<Arc<Mutex<BlockCache>>> {
        let mut queue = self.queue.lock();
        if let Some(pair) = queue.iter().find(|pair| pair.0 == block_id) {
            return Ok(Arc::clone(&pair.1));
        }
        if queue.len() >= self.capacity {
            let victim = queue
                .iter()
                .enumerate()
                .find(|(_, pair)| Arc::strong_count(&pair.1) == 1)
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    if let Some((id, cache)) = queue.remove(idx) {
                        cache.lock().sync()?;
                        debug!("block cache: evicted block {}", id);
                    }
                }
                None => {
                    return Err(super::FsError::Config(format!(
                        "run out of block cache ({} buffers in use)",
                        self.capacity
                    )))
                }
            }
        }
        let block_cache = Arc::new(Mutex::new(BlockCache::new(
            block_id + self.base,
            self.block_size,
            Arc::clone(&self.block_device),
        )?));
        queue.push_back((block_id, Arc::clone(&block_cache)));
        Ok(block_cache)
    }

    /// 立即写回一个块 (如果它在缓存里), 用于同步元数据模式
    pub fn sync_block(&self, block_id: usize) -> FsResult<()> {
        let cache = {
            let queue = self.queue.lock();
            queue
                .iter()
                .find(|pair| pair.0 == block_id)
                .map(|pair| Arc::clone(&pair.1))
        };
        if let Some(cache) = cache {
            cache.lock().sync()?;
        }
        Ok(())
    }

    pub fn sync_all(&self) -> FsResult<()> {
        let caches: Vec<_> = self
            .queue
            .lock()
            .iter()
            .map(|pair| Arc::clone(&pair.1))
            .collect();
        for cache in caches {
            cache.lock().sync()?;
        }
        Ok(())
    }

    /// 从块地址 block_id 开始读取 len 个字节, 可以跨越多个连续的块
    pub fn read_bytes(&self, block_id: usize, len: usize) -> FsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut id = block_id;
        while out.len() < len {
            let take = (len - out.len()).min(self.block_size);
            self.get_block_cache(id)?
                .lock()
                .read(0, |bytes| out.extend_from_slice(&bytes[..take]));
            id += 1;
        }
        Ok(out)
    }

    /// 把 data 写到从 block_id 开始的连续块中
    pub fn write_bytes(&self, block_id: usize, data: &[u8]) -> FsResult<()> {
        for (i, chunk) in data.chunks(self.block_size).enumerate() {
            self.get_block_cache(block_id + i)?
                .lock()
                .modify(0, |bytes| bytes[..chunk.len()].copy_from_slice(chunk));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemDevice;

    #[test]
    fn modified_block_written_back_on_sync() {
        let dev = Arc::new(MemDevice::new(8 * 1024));
        let mgr = BlockCacheManager::new(dev.clone(), 1024, 0, 4);
        mgr.get_block_cache(3)
            .unwrap()
            .lock()
            .modify(10, |bytes| bytes[0] = 0xab);
        assert_eq!(dev.snapshot()[3 * 1024 + 10], 0);
        mgr.sync_all().unwrap();
        assert_eq!(dev.snapshot()[3 * 1024 + 10], 0xab);
    }

    #[test]
    fn eviction_writes_back_and_respects_base() {
        let dev = Arc::new(MemDevice::new(16 * 512));
        let mgr = BlockCacheManager::new(dev.clone(), 512, 2, 2);
        mgr.write_bytes(0, &[1u8; 700]).unwrap();
        // 第三个块把第一个挤出去
        mgr.get_block_cache(5).unwrap();
        let snap = dev.snapshot();
        assert!(snap[2 * 512..3 * 512].iter().all(|b| *b == 1));
        assert_eq!(mgr.read_bytes(0, 700).unwrap(), vec![1u8; 700]);
    }

    #[test]
    fn all_buffers_in_use_is_an_error() {
        let dev = Arc::new(MemDevice::new(8 * 512));
        let mgr = BlockCacheManager::new(dev, 512, 0, 1);
        let _held = mgr.get_block_cache(0).unwrap();
        assert!(mgr.get_block_cache(1).is_err());
    }
}
