//! 扇区设备接口层: 只支持以扇区为单位的随机读写, 由具体的设备驱动来实现.
//! 扇区缓存层 ([`super::BlockCacheManager`]) 是它唯一的调用者.

use std::any::Any;

// 本文件系统中 "块" 与 "扇区" 是同一个概念:
// 一次读写恰好 SECTOR_SIZE 字节, 同步完成, 不存在只传输一部分的情况.
// 设备自己负责串行化并发请求.

pub trait BlockDevice: Send + Sync + Any {
    /// 将编号为 `block_id` 的扇区读入 `buf`, `buf` 的长度必须是 SECTOR_SIZE
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    /// 将 `buf` 写入编号为 `block_id` 的扇区
    fn write_block(&self, block_id: usize, buf: &[u8]);

    /// 设备上的扇区总数
    fn block_count(&self) -> usize;
}
