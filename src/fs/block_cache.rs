//! 扇区缓存层: 在内存中缓存磁盘扇区的数据, 避免频繁读写磁盘.
//!
//! 先通过 read_block 将一个扇区上的数据读到内存中的缓冲区 [`BlockCache`],
//! 之后对它的访问都在内存中完成; 被修改过的缓冲区在被换出, 被 `sync_all`
//! 或者被 drop 的时候才通过 write_block 写回.
//!
//! 与只有一块磁盘的内核不同, 这里每个文件系统实例都持有自己的 [`BlockCacheManager`],
//! 由调用者显式地传给文件头和目录, 不存在进程级别的全局缓存.
//! 管理器以扇区号为键, 嵌套的文件头也是通过扇区号从这里取出来的.

use std::{collections::VecDeque, sync::Arc};

use log::trace;
use spin::Mutex;

use super::{BlockDevice, BLOCK_CACHE_SIZE, SECTOR_SIZE};

/// 缓冲区需要按 8 字节对齐, 这样才能把它当作 `#[repr(C)]` 的磁盘结构来访问
#[repr(C, align(8))]
struct SectorBuf([u8; SECTOR_SIZE]);

/// Cached sector inside memory
pub struct BlockCache {
    /// 位于内存中的缓冲区, 恰好一个扇区
    cache: SectorBuf,
    /// 这个缓存来自于磁盘中的哪个扇区
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    /// 从磁盘载入之后有没有被修改过
    modified: bool,
}

impl BlockCache {
    /// 创建一个 BlockCache: 这将触发一次 read_block
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = SectorBuf([0u8; SECTOR_SIZE]);
        block_device.read_block(block_id, &mut cache.0);
        Self {
            cache,
            block_id,
            block_device,
            modified: false,
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache.0[offset] as *const u8 as usize
    }

    /// 获取缓冲区中位于偏移量 offset 的一个类型为 T 的磁盘上数据结构的不可变引用.
    /// T 必须是 `#[repr(C)]` 的纯数据类型, 对齐不超过 8, 并且任意字节序列都是它的合法值.
    pub fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        // 确认 T 被整个包含在扇区之内
        assert!(offset + type_size <= SECTOR_SIZE);
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0, "misaligned sector access");
        unsafe { &*(addr as *const T) }
    }

    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= SECTOR_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0, "misaligned sector access");
        unsafe { &mut *(addr as *mut T) }
    }

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    pub fn sync(&mut self) {
        if self.modified {
            trace!("write back sector {}", self.block_id);
            self.block_device.write_block(self.block_id, &self.cache.0);
            self.modified = false;
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync();
    }
}

/// 一个设备上所有扇区缓存的管理器, 最多同时驻留 BLOCK_CACHE_SIZE 个扇区
pub struct BlockCacheManager {
    queue: Mutex<VecDeque<(usize, Arc<Mutex<BlockCache>>)>>,
    block_device: Arc<dyn BlockDevice>,
}

impl BlockCacheManager {
    pub fn new(block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            block_device,
        }
    }

    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }

    pub fn get_block_cache(&self, block_id: usize) -> Arc<Mutex<BlockCache>> {
        let mut queue = self.queue.lock();
        if let Some(pair) = queue.iter().find(|pair| pair.0 == block_id) {
            return Arc::clone(&pair.1);
        }
        if queue.len() == BLOCK_CACHE_SIZE {
            // 换出一个当前没有被别人持有的缓存, drop 时会自动写回
            if let Some((idx, _)) = queue
                .iter()
                .enumerate()
                .find(|(_, pair)| Arc::strong_count(&pair.1) == 1)
            {
                queue.remove(idx);
            } else {
                panic!("Run out of BlockCache");
            }
        }
        let block_cache = Arc::new(Mutex::new(BlockCache::new(
            block_id,
            Arc::clone(&self.block_device),
        )));
        queue.push_back((block_id, Arc::clone(&block_cache)));
        block_cache
    }

    /// 把所有被修改过的扇区写回设备
    pub fn sync_all(&self) {
        let queue = self.queue.lock();
        for (_, block_cache) in queue.iter() {
            block_cache.lock().sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    type DataBlock = [u8; SECTOR_SIZE];

    #[test]
    fn modified_sector_is_written_back_on_sync() {
        let disk = Arc::new(RamDisk::new(8));
        let manager = BlockCacheManager::new(disk.clone());
        manager
            .get_block_cache(3)
            .lock()
            .modify(0, |block: &mut DataBlock| block[5] = 0x55);

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_block(3, &mut raw);
        assert_eq!(raw[5], 0, "write back happens lazily");

        manager.sync_all();
        disk.read_block(3, &mut raw);
        assert_eq!(raw[5], 0x55);
    }

    #[test]
    fn eviction_flushes_dirty_sector() {
        let disk = Arc::new(RamDisk::new(64));
        let manager = BlockCacheManager::new(disk.clone());
        manager
            .get_block_cache(0)
            .lock()
            .modify(4, |word: &mut u32| *word = 0xdead_beef);
        for id in 1..=BLOCK_CACHE_SIZE {
            manager.get_block_cache(id).lock().read(0, |_: &DataBlock| ());
        }

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_block(0, &mut raw);
        assert_eq!(&raw[4..8], &0xdead_beef_u32.to_ne_bytes());
    }

    #[test]
    fn same_sector_shares_one_cache() {
        let disk = Arc::new(RamDisk::new(4));
        let manager = BlockCacheManager::new(disk);
        let a = manager.get_block_cache(2);
        let b = manager.get_block_cache(2);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
