//! 磁盘数据结构层: [`FileHeader`] 与 [`DirEntry`].
//!
//! 文件头 (相当于 inode) 恰好占满一个扇区: 文件大小, 已用指针数, 以及 NUM_DIRECT 个扇区号.
//! 没有单独的一级/二级/三级间接索引字段, 指针表指向数据扇区还是指向下一层文件头,
//! 完全由文件大小决定:
//!
//! - 大小不超过 `capacity(0) = NUM_DIRECT * SECTOR_SIZE` 时, 每个指针直接指向数据扇区;
//! - 否则找到最小的 d 使得大小不超过 `capacity(d)`, 每个指针指向一个
//!   最多容纳 `capacity(d - 1)` 字节的下一层文件头, 下一层再按同样的规则递归.
//!
//! 层数从不写到磁盘上, 任何时候都可以由 `num_bytes` 重新推出来.

use std::fmt::Write as _;

use log::{debug, warn};

use super::{
    BlockCacheManager, FreeMap, FsError, Result, DIRENT_SIZE, MAX_DEPTH, NAME_LENGTH_LIMIT,
    NUM_DIRECT, SECTOR_SIZE,
};

type DataBlock = [u8; SECTOR_SIZE];

/// 深度为 `depth` 的文件头最多能索引的字节数
pub const fn capacity(depth: usize) -> usize {
    let mut cap = SECTOR_SIZE * NUM_DIRECT;
    let mut d = 0;
    while d < depth {
        cap *= NUM_DIRECT;
        d += 1;
    }
    cap
}

/// 单个文件的最大字节数
pub const MAX_FILE_SIZE: usize = capacity(MAX_DEPTH);

/// 容纳 `size` 字节所需的最小嵌套深度
pub fn depth_for(size: usize) -> usize {
    let mut depth = 0;
    while size > capacity(depth) {
        depth += 1;
    }
    depth
}

/// 指针表中的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// 指向一个数据扇区
    Data(u32),
    /// 指向一个下一层的文件头
    Nested(u32),
}

impl Slot {
    pub fn sector(&self) -> u32 {
        match *self {
            Slot::Data(sector) | Slot::Nested(sector) => sector,
        }
    }
}

/// 磁盘上的文件头, 布局与扇区逐字节对应
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// 文件的字节数
    num_bytes: i32,
    /// 指针表中实际使用的项数
    num_sectors: i32,
    data_sectors: [i32; NUM_DIRECT],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == SECTOR_SIZE);

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHeader {
    /// 一个还没有绑定到磁盘的文件头, 所有字段都是哨兵值 -1,
    /// 之后通过 [`FileHeader::allocate`] 或 [`FileHeader::fetch_from`] 初始化
    pub fn new() -> Self {
        Self {
            num_bytes: -1,
            num_sectors: -1,
            data_sectors: [-1; NUM_DIRECT],
        }
    }

    pub fn is_bound(&self) -> bool {
        self.num_bytes >= 0
    }

    /// Return the number of bytes in the file.
    pub fn file_length(&self) -> usize {
        self.num_bytes.max(0) as usize
    }

    pub fn num_slots(&self) -> usize {
        self.num_sectors.max(0) as usize
    }

    pub fn depth(&self) -> usize {
        depth_for(self.file_length())
    }

    /// 已使用的指针表项, 类型由深度决定
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        let nested = self.depth() > 0;
        self.data_sectors[..self.num_slots()]
            .iter()
            .map(move |&sector| {
                if nested {
                    Slot::Nested(sector as u32)
                } else {
                    Slot::Data(sector as u32)
                }
            })
    }

    /// 容纳 `size` 字节需要的扇区总数: 数据扇区加上所有下一层文件头所在的扇区
    pub fn sectors_required(size: usize) -> usize {
        let depth = depth_for(size);
        if depth == 0 {
            return (size + SECTOR_SIZE - 1) / SECTOR_SIZE;
        }
        let chunk = capacity(depth - 1);
        let full = size / chunk;
        let rest = size % chunk;
        let mut total = full * (1 + Self::sectors_required(chunk));
        if rest > 0 {
            total += 1 + Self::sectors_required(rest);
        }
        total
    }

    /// 为一个新文件分配 `size` 字节的存储空间.
    ///
    /// 空闲扇区少于 `ceil(size / SECTOR_SIZE)` 时直接失败. 递归过程中如果某一次分配失败,
    /// 本次调用已经拿到的所有扇区都会被归还, 文件头回到未绑定的状态.
    pub fn allocate(
        &mut self,
        free_map: &mut dyn FreeMap,
        cache: &BlockCacheManager,
        size: usize,
    ) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge(size));
        }
        let data_sectors = (size + SECTOR_SIZE - 1) / SECTOR_SIZE;
        if free_map.num_clear() < data_sectors {
            return Err(FsError::NoSpace);
        }

        let mut claimed = Vec::new();
        if let Err(err) = self.allocate_level(free_map, cache, size, &mut claimed) {
            warn!(
                "allocating {} bytes failed, returning {} sectors",
                size,
                claimed.len()
            );
            for sector in claimed.into_iter().rev() {
                free_map.clear(sector);
            }
            *self = Self::new();
            return Err(err);
        }
        debug!(
            "allocated {} bytes with depth {} in {} sectors",
            size,
            self.depth(),
            claimed.len()
        );
        Ok(())
    }

    fn allocate_level(
        &mut self,
        free_map: &mut dyn FreeMap,
        cache: &BlockCacheManager,
        size: usize,
        claimed: &mut Vec<u32>,
    ) -> Result<()> {
        self.num_bytes = size as i32;
        self.num_sectors = 0;
        let depth = depth_for(size);

        if depth == 0 {
            let count = (size + SECTOR_SIZE - 1) / SECTOR_SIZE;
            for i in 0..count {
                let sector = free_map.find_and_set().ok_or(FsError::NoSpace)?;
                claimed.push(sector);
                self.data_sectors[i] = sector as i32;
                self.num_sectors += 1;
            }
            return Ok(());
        }

        // 每个下一层文件头最多容纳 capacity(depth - 1) 字节
        let chunk = capacity(depth - 1);
        let mut remaining = size;
        let mut i = 0;
        while remaining > 0 {
            let sector = free_map.find_and_set().ok_or(FsError::NoSpace)?;
            claimed.push(sector);
            self.data_sectors[i] = sector as i32;
            self.num_sectors += 1;

            let part = remaining.min(chunk);
            let mut next_level = FileHeader::new();
            next_level.allocate_level(free_map, cache, part, claimed)?;
            next_level.write_back(cache, sector);

            remaining -= part;
            i += 1;
        }
        Ok(())
    }

    /// 回收这个文件头拥有的全部扇区 (不包括文件头自己所在的扇区).
    ///
    /// 按值消耗 `self`, 同一个内存中的文件头不会被回收两次.
    pub fn deallocate(self, free_map: &mut dyn FreeMap, cache: &BlockCacheManager) {
        for slot in self.slots() {
            match slot {
                Slot::Nested(sector) => {
                    FileHeader::fetch_from(cache, sector).deallocate(free_map, cache);
                    free_map.clear(sector);
                }
                Slot::Data(sector) => {
                    assert!(free_map.test(sector), "data sector {} ought to be marked", sector);
                    free_map.clear(sector);
                }
            }
        }
    }

    /// 从磁盘读出 `sector` 上的文件头
    pub fn fetch_from(cache: &BlockCacheManager, sector: u32) -> Self {
        cache
            .get_block_cache(sector as usize)
            .lock()
            .read(0, |hdr: &FileHeader| hdr.clone())
    }

    /// 把文件头写到 `sector`
    pub fn write_back(&self, cache: &BlockCacheManager, sector: u32) {
        cache
            .get_block_cache(sector as usize)
            .lock()
            .modify(0, |hdr: &mut FileHeader| *hdr = self.clone());
    }

    /// 文件内偏移 `offset` 处的字节存放在哪个扇区.
    ///
    /// 沿着与分配时相同的阶梯往下走: 每一层用偏移除以下一层的容量选出指针,
    /// 余数交给下一层, 直到最底层用 `offset / SECTOR_SIZE` 直接查表.
    pub fn byte_to_sector(&self, cache: &BlockCacheManager, offset: usize) -> u32 {
        assert!(
            offset < self.file_length(),
            "offset {} out of file of {} bytes",
            offset,
            self.file_length()
        );
        let depth = self.depth();
        if depth == 0 {
            return self.data_sectors[offset / SECTOR_SIZE] as u32;
        }
        let chunk = capacity(depth - 1);
        let index = offset / chunk;
        FileHeader::fetch_from(cache, self.data_sectors[index] as u32)
            .byte_to_sector(cache, offset - index * chunk)
    }

    /// 这个文件头拥有的所有扇区, 先序: 下一层文件头在它的数据之前
    pub fn sectors(&self, cache: &BlockCacheManager) -> Vec<u32> {
        let mut v = Vec::new();
        self.collect_sectors(cache, &mut v);
        v
    }

    fn collect_sectors(&self, cache: &BlockCacheManager, v: &mut Vec<u32>) {
        for slot in self.slots() {
            v.push(slot.sector());
            if let Slot::Nested(sector) = slot {
                FileHeader::fetch_from(cache, sector).collect_sectors(cache, v);
            }
        }
    }

    /// 文件头以及它指向的全部数据, 不可打印的字节以 `\xx` 的形式输出
    pub fn print(&self, cache: &BlockCacheManager) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "FileHeader contents.  File size: {}.  File blocks:",
            self.num_bytes
        );
        if self.depth() > 0 {
            for slot in self.slots() {
                out.push_str(&FileHeader::fetch_from(cache, slot.sector()).print(cache));
            }
            return out;
        }

        let sectors: Vec<String> = self.slots().map(|s| s.sector().to_string()).collect();
        let _ = writeln!(out, "{}", sectors.join(" "));
        out.push_str("File contents:\n");
        let mut remaining = self.file_length();
        for slot in self.slots() {
            let data = cache
                .get_block_cache(slot.sector() as usize)
                .lock()
                .read(0, |block: &DataBlock| *block);
            for &byte in data.iter().take(remaining) {
                if (0x20..=0x7e).contains(&byte) {
                    out.push(byte as char);
                } else {
                    let _ = write!(out, "\\{:x}", byte);
                }
            }
            remaining = remaining.saturating_sub(SECTOR_SIZE);
            out.push('\n');
        }
        out
    }

    /// 列出所有下一层文件头所在的扇区, 数据扇区不列出
    pub fn print_use(&self, cache: &BlockCacheManager) -> String {
        let mut out = String::new();
        for slot in self.slots() {
            if let Slot::Nested(sector) = slot {
                let _ = write!(out, "{} ", sector);
                out.push_str(&FileHeader::fetch_from(cache, sector).print_use(cache));
            }
        }
        out
    }
}

/// 目录项, 磁盘上占 DIRENT_SIZE 字节
#[repr(C)]
#[derive(Clone, Debug)]
pub struct DirEntry {
    active: u8,
    is_dir: u8,
    name: [u8; NAME_LENGTH_LIMIT + 1], // 以 0 结尾
    sector: i32,
}

const _: () = assert!(std::mem::size_of::<DirEntry>() == DIRENT_SIZE);

impl DirEntry {
    pub fn create_empty() -> Self {
        Self {
            active: 0,
            is_dir: 0,
            name: [0; NAME_LENGTH_LIMIT + 1],
            sector: 0,
        }
    }

    /// 名字超过 NAME_LENGTH_LIMIT 字节时拒绝, 不做截断.
    /// 磁盘上的名字以 0 结尾, 所以名字中间也不能出现 0
    pub fn new(name: &str, sector: u32, is_dir: bool) -> Result<Self> {
        if name.len() > NAME_LENGTH_LIMIT {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        if name.contains('\0') {
            return Err(FsError::InvalidPath(format!("{:?} contains a NUL byte", name)));
        }
        let mut name_bytes = [0; NAME_LENGTH_LIMIT + 1];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            active: 1,
            is_dir: is_dir as u8,
            name: name_bytes,
            sector: sector as i32,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    /// 所有字段都是整数, 任意字节序列都是合法的 DirEntry
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut Self as *mut u8, DIRENT_SIZE) }
    }

    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn deactivate(&mut self) {
        self.active = 0;
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn sector(&self) -> u32 {
        self.sector as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::fs::Bitmap;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn setup(sectors: usize) -> (Bitmap, BlockCacheManager) {
        let disk = Arc::new(RamDisk::new(sectors));
        (Bitmap::new(sectors), BlockCacheManager::new(disk))
    }

    #[test]
    fn capacity_ladder_matches_geometry() {
        assert_eq!(NUM_DIRECT, 30);
        assert_eq!(capacity(0), 3840);
        assert_eq!(capacity(1), 115_200);
        assert_eq!(capacity(2), 3_456_000);
        assert_eq!(MAX_FILE_SIZE, 103_680_000);
        assert_eq!(depth_for(0), 0);
        assert_eq!(depth_for(3840), 0);
        assert_eq!(depth_for(3841), 1);
        assert_eq!(depth_for(115_201), 2);
    }

    #[test]
    fn zero_length_file_owns_no_sectors() {
        let (mut map, cache) = setup(64);
        let mut hdr = FileHeader::new();
        assert!(!hdr.is_bound());
        hdr.allocate(&mut map, &cache, 0).unwrap();
        assert!(hdr.is_bound());
        assert_eq!(hdr.num_slots(), 0);
        assert_eq!(map.num_clear(), 64);
    }

    #[test]
    fn allocate_4000_bytes_nests_one_level() {
        let (mut map, cache) = setup(64);
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, 4000).unwrap();

        assert_eq!(hdr.file_length(), 4000);
        assert_eq!(hdr.depth(), 1);
        // 3840 字节放在第一个下一层文件头, 剩下 160 字节放在第二个
        let slots: Vec<Slot> = hdr.slots().collect();
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| matches!(s, Slot::Nested(_))));
        let first = FileHeader::fetch_from(&cache, slots[0].sector());
        let second = FileHeader::fetch_from(&cache, slots[1].sector());
        assert_eq!(first.file_length(), 3840);
        assert_eq!(first.num_slots(), 30);
        assert_eq!(second.file_length(), 160);
        assert_eq!(second.num_slots(), 2);

        assert_eq!(FileHeader::sectors_required(4000), 34);
        assert_eq!(map.num_clear(), 64 - 34);
    }

    #[test]
    fn allocate_then_deallocate_restores_free_map() {
        for &size in &[1, 128, 129, 3840, 3841, 50_000, 115_200, 115_201, 300_000] {
            let (mut map, cache) = setup(4096);
            map.mark(0);
            let before = map.marked();
            let mut hdr = FileHeader::new();
            hdr.allocate(&mut map, &cache, size).unwrap();
            assert_eq!(
                map.num_clear(),
                4095 - FileHeader::sectors_required(size),
                "size {}",
                size
            );
            hdr.deallocate(&mut map, &cache);
            assert_eq!(map.marked(), before, "size {}", size);
        }
    }

    #[test]
    fn byte_to_sector_stays_within_claimed_sectors() {
        let (mut map, cache) = setup(4096);
        let mut hdr = FileHeader::new();
        let size = 2 * capacity(1) + 777;
        hdr.allocate(&mut map, &cache, size).unwrap();
        assert_eq!(hdr.depth(), 2);

        let owned: HashSet<u32> = hdr.sectors(&cache).into_iter().collect();
        assert_eq!(owned.len(), FileHeader::sectors_required(size));
        let mut data = HashSet::new();
        for offset in (0..size).step_by(SECTOR_SIZE / 2).chain([size - 1]) {
            let sector = hdr.byte_to_sector(&cache, offset);
            assert!(owned.contains(&sector));
            assert!(map.test(sector));
            data.insert(sector);
        }
        // 每个数据扇区恰好对应一段连续的 SECTOR_SIZE 字节
        assert_eq!(data.len(), (size + SECTOR_SIZE - 1) / SECTOR_SIZE);
    }

    #[test]
    fn consecutive_offsets_in_one_sector_agree() {
        let (mut map, cache) = setup(256);
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, 5000).unwrap();
        assert_eq!(
            hdr.byte_to_sector(&cache, 3840),
            hdr.byte_to_sector(&cache, 3840 + SECTOR_SIZE - 1)
        );
        assert_ne!(
            hdr.byte_to_sector(&cache, 3839),
            hdr.byte_to_sector(&cache, 3840)
        );
    }

    #[test]
    fn too_few_data_sectors_fails_up_front() {
        let (mut map, cache) = setup(40);
        for s in 0..10 {
            map.mark(s);
        }
        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut map, &cache, 31 * SECTOR_SIZE),
            Err(FsError::NoSpace)
        ));
        assert_eq!(map.num_clear(), 30);
    }

    #[test]
    fn exhaustion_mid_recursion_rolls_back_everything() {
        // 4000 字节需要 32 个数据扇区 + 2 个文件头扇区, 只给 33 个
        let (mut map, cache) = setup(64);
        for s in 0..31 {
            map.mark(s);
        }
        assert_eq!(map.num_clear(), 33);
        let before = map.marked();

        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut map, &cache, 4000),
            Err(FsError::NoSpace)
        ));
        assert_eq!(map.marked(), before);
        assert!(!hdr.is_bound());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let (mut map, cache) = setup(8);
        let mut hdr = FileHeader::new();
        assert!(matches!(
            hdr.allocate(&mut map, &cache, MAX_FILE_SIZE + 1),
            Err(FsError::FileTooLarge(_))
        ));
    }

    #[test]
    fn header_survives_write_back_and_fetch() {
        let (mut map, cache) = setup(64);
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, 300).unwrap();
        hdr.write_back(&cache, 7);
        assert_eq!(FileHeader::fetch_from(&cache, 7), hdr);
    }

    #[test]
    #[should_panic(expected = "out of file")]
    fn byte_to_sector_past_end_panics() {
        let (mut map, cache) = setup(16);
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, 10).unwrap();
        hdr.byte_to_sector(&cache, 10);
    }

    #[test]
    fn print_use_lists_nested_headers_only() {
        let (mut map, cache) = setup(64);
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, 4000).unwrap();
        let nested: Vec<String> = hdr.slots().map(|s| s.sector().to_string()).collect();
        assert_eq!(hdr.print_use(&cache).split_whitespace().collect::<Vec<_>>(), nested);
    }

    #[test]
    fn overlong_names_are_rejected() {
        assert!(DirEntry::new("123456789", 3, false).is_ok());
        assert!(matches!(
            DirEntry::new("0123456789", 3, false),
            Err(FsError::NameTooLong(_))
        ));
        let entry = DirEntry::new("sub", 9, true).unwrap();
        assert_eq!(entry.name(), "sub");
        assert!(entry.is_dir() && entry.is_active());
        assert_eq!(entry.as_bytes().len(), DIRENT_SIZE);
    }

    #[test]
    fn names_with_nul_are_rejected() {
        for name in ["a\0b", "\0", "abc\0"] {
            assert!(matches!(
                DirEntry::new(name, 3, false),
                Err(FsError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn three_level_file_round_trip() {
        let sectors = 30_000;
        let (mut map, cache) = setup(sectors);
        let size = capacity(2) + 1000;
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, size).unwrap();

        assert_eq!(hdr.depth(), 3);
        // 一个装满的两层文件头, 加上一个装剩下 1000 字节的直接索引文件头
        assert_eq!(hdr.num_slots(), 2);
        let required = FileHeader::sectors_required(size);
        assert_eq!(map.num_clear(), sectors - required);
        let owned = hdr.sectors(&cache);
        assert_eq!(owned.len(), required);
        assert_eq!(owned.iter().collect::<HashSet<_>>().len(), required);

        for offset in [0, capacity(2) - 1, capacity(2), size - 1] {
            let sector = hdr.byte_to_sector(&cache, offset);
            assert!(map.test(sector), "offset {}", offset);
        }

        hdr.deallocate(&mut map, &cache);
        assert_eq!(map.num_clear(), sectors);
        assert!(map.marked().is_empty());
    }
}
