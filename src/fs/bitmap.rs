//! 空闲扇区位图.
//!
//! 每个 bit 代表一个扇区的分配状态, 0 意味着空闲, 1 意味着已经分配出去.
//! 位图所要做的事情是通过以 bit 为单位的分配 (寻找一个为 0 的 bit 并设置为 1)
//! 和回收 (将 bit 清零) 来管理整块磁盘.
//!
//! 位图常驻内存, 持久化时作为一个普通文件存放在磁盘上 (文件头在 FREE_MAP_SECTOR),
//! 读写都通过 [`OpenFile`] 完成.

use log::trace;

use super::OpenFile;

/// 文件头和目录在分配/回收扇区时看到的空闲空间接口.
///
/// 所有文件头和目录共享同一个 FreeMap, 一致性 (可达的扇区都被标记, 被标记的扇区都可达)
/// 由调用者维护, FreeMap 本身不提供事务.
pub trait FreeMap {
    /// 空闲扇区的数量
    fn num_clear(&self) -> usize;
    /// 找到一个空闲扇区并标记为已分配, 全满时返回 None
    fn find_and_set(&mut self) -> Option<u32>;
    /// 把一个扇区标记为已分配
    fn mark(&mut self, sector: u32);
    /// 回收一个扇区, 该扇区必须已经被标记
    fn clear(&mut self, sector: u32);
    fn test(&self, sector: u32) -> bool;
}

/// 每个 u64 打包一组 64 bits, 按组查找可以跳过已经全满的组
pub struct Bitmap {
    bits: Vec<u64>,
    num_bits: usize,
}

impl Bitmap {
    pub fn new(num_bits: usize) -> Self {
        Self {
            bits: vec![0; (num_bits + 63) / 64],
            num_bits,
        }
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// 位图在磁盘上占用的字节数
    pub fn byte_len(&self) -> usize {
        (self.num_bits + 7) / 8
    }

    /// 从位图文件中读回内容
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut bytes = vec![0u8; self.bits.len() * 8];
        let len = self.byte_len();
        file.read_at(&mut bytes[..len], 0);
        for (word, chunk) in self.bits.iter_mut().zip(bytes.chunks(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *word = u64::from_le_bytes(buf);
        }
    }

    /// 把位图写回位图文件
    pub fn write_back(&self, file: &OpenFile) {
        let bytes: Vec<u8> = self.bits.iter().flat_map(|word| word.to_le_bytes()).collect();
        file.write_at(&bytes[..self.byte_len()], 0);
    }

    /// 所有被标记的扇区, 从小到大
    pub fn marked(&self) -> Vec<u32> {
        (0..self.num_bits as u32).filter(|&s| self.test(s)).collect()
    }
}

/// 将 bit 编号分解为组编号和组内编号
fn decomposition(bit: usize) -> (usize, usize) {
    (bit / 64, bit % 64)
}

impl FreeMap for Bitmap {
    fn num_clear(&self) -> usize {
        let used: u32 = self.bits.iter().map(|word| word.count_ones()).sum();
        self.num_bits - used as usize
    }

    fn find_and_set(&mut self) -> Option<u32> {
        // 找到一个尚未全满的组, 通过 trailing_ones 找到最低的一个 0
        let (pos, inner) = self
            .bits
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(pos, word)| (pos, word.trailing_ones() as usize))?;
        let bit = pos * 64 + inner;
        // 最后一组里超出 num_bits 的部分不能分配
        if bit >= self.num_bits {
            return None;
        }
        self.bits[pos] |= 1 << inner;
        trace!("allocate sector {}", bit);
        Some(bit as u32)
    }

    fn mark(&mut self, sector: u32) {
        assert!((sector as usize) < self.num_bits);
        let (pos, inner) = decomposition(sector as usize);
        self.bits[pos] |= 1 << inner;
    }

    fn clear(&mut self, sector: u32) {
        assert!((sector as usize) < self.num_bits);
        let (pos, inner) = decomposition(sector as usize);
        // 回收一个没有被标记的扇区说明别处已经损坏了
        assert!(
            self.bits[pos] & (1 << inner) != 0,
            "sector {} is not allocated",
            sector
        );
        self.bits[pos] &= !(1u64 << inner);
        trace!("free sector {}", sector);
    }

    fn test(&self, sector: u32) -> bool {
        if sector as usize >= self.num_bits {
            return false;
        }
        let (pos, inner) = decomposition(sector as usize);
        self.bits[pos] & (1 << inner) != 0
    }
}
