//! 目录: 一张固定容量的目录项表, 把名字绑定到文件头所在的扇区.
//!
//! 目录本身就是一个普通文件, 表从文件偏移 0 开始逐项存放.
//! 子目录的目录项指向子目录文件的文件头, 子目录的数据扇区里又是一张目录表,
//! 所以整棵目录树都可以从根目录递归地展开. 子目录的 [`Directory`] 只是内存中
//! 临时重建出来的视图, 用完即丢.
//!
//! 目录内部不加锁: 从 `fetch_from` 到 `write_back` 之间对同一个目录的并发访问
//! 需要由调用者串行化.

use std::fmt::Write as _;
use std::sync::Arc;

use log::debug;

use super::{
    BlockCacheManager, DirEntry, FileHeader, FreeMap, FsError, OpenFile, Result, DIRENT_SIZE,
};

pub struct Directory {
    table: Vec<DirEntry>,
}

impl Directory {
    /// 一个空目录, 容量为 `size` 个目录项, 之后不会再增长
    pub fn new(size: usize) -> Self {
        Self {
            table: (0..size).map(|_| DirEntry::create_empty()).collect(),
        }
    }

    /// 打开 `sector` 上的目录文件并读出目录表, 容量由目录文件的大小决定
    pub fn load(cache: &Arc<BlockCacheManager>, sector: u32) -> (Self, OpenFile) {
        let file = OpenFile::new(Arc::clone(cache), sector);
        let mut dir = Self::new(file.length() / DIRENT_SIZE);
        dir.fetch_from(&file);
        (dir, file)
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// 目录表在磁盘上占的字节数
    pub fn file_size(&self) -> usize {
        self.table.len() * DIRENT_SIZE
    }

    pub fn fetch_from(&mut self, file: &OpenFile) {
        for (i, entry) in self.table.iter_mut().enumerate() {
            file.read_at(entry.as_bytes_mut(), i * DIRENT_SIZE);
        }
    }

    pub fn write_back(&self, file: &OpenFile) {
        for (i, entry) in self.table.iter().enumerate() {
            file.write_at(entry.as_bytes(), i * DIRENT_SIZE);
        }
    }

    /// 所有有效的目录项
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> + '_ {
        self.table.iter().filter(|entry| entry.is_active())
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|entry| entry.is_active() && entry.name() == name)
    }

    /// 名字对应的文件头所在扇区
    pub fn find(&self, name: &str) -> Option<u32> {
        self.find_index(name).map(|i| self.table[i].sector())
    }

    pub fn find_is_dir(&self, name: &str) -> Option<bool> {
        self.find_index(name).map(|i| self.table[i].is_dir())
    }

    /// 名字不存在时返回 false
    pub fn is_dir(&self, name: &str) -> bool {
        self.find_is_dir(name).unwrap_or(false)
    }

    /// 占用第一个空闲的目录项. 名字已存在或者目录已满时失败, 目录表保持不变
    pub fn add(&mut self, name: &str, sector: u32, is_dir: bool) -> Result<()> {
        if name.is_empty() {
            return Err(FsError::InvalidPath("empty name".to_string()));
        }
        let entry = DirEntry::new(name, sector, is_dir)?;
        if self.find_index(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        let slot = self
            .table
            .iter_mut()
            .find(|entry| !entry.is_active())
            .ok_or(FsError::DirectoryFull)?;
        *slot = entry;
        Ok(())
    }

    /// 只把目录项标记为无效, 不移动其它目录项
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let i = self
            .find_index(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        self.table[i].deactivate();
        Ok(())
    }

    /// 深度优先, 自底向上地删除整棵子树: 子目录先被清空并写回,
    /// 然后回收子目录自己的扇区, 最后才删除指向它的目录项.
    pub fn recursive_remove(&mut self, free_map: &mut dyn FreeMap, cache: &Arc<BlockCacheManager>) {
        for i in 0..self.table.len() {
            if self.table[i].is_active() {
                self.release_entry(i, free_map, cache);
            }
        }
    }

    /// 删除名为 `name` 的目录项并回收它拥有的全部扇区, 子目录会先被递归清空
    pub fn recursive_remove_entry(
        &mut self,
        name: &str,
        free_map: &mut dyn FreeMap,
        cache: &Arc<BlockCacheManager>,
    ) -> Result<()> {
        let i = self
            .find_index(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        self.release_entry(i, free_map, cache);
        Ok(())
    }

    fn release_entry(
        &mut self,
        i: usize,
        free_map: &mut dyn FreeMap,
        cache: &Arc<BlockCacheManager>,
    ) {
        let sector = self.table[i].sector();
        let hdr = if self.table[i].is_dir() {
            let (mut sub, file) = Directory::load(cache, sector);
            sub.recursive_remove(free_map, cache);
            sub.write_back(&file);
            file.header().clone()
        } else {
            FileHeader::fetch_from(cache, sector)
        };
        debug!("release {:?} at sector {}", self.table[i].name(), sector);
        hdr.deallocate(free_map, cache);
        free_map.clear(sector);
        self.table[i].deactivate();
    }

    fn describe(entry: &DirEntry) -> String {
        if entry.is_dir() {
            format!("[D] {}", entry.name())
        } else {
            format!("[F] {}", entry.name())
        }
    }

    /// 本层的所有名字
    pub fn list(&self) -> Vec<String> {
        self.entries().map(Self::describe).collect()
    }

    /// 先序遍历整棵子树, 每深一层多缩进两个空格
    pub fn recursive_list(&self, cache: &Arc<BlockCacheManager>, depth: usize) -> Vec<String> {
        let mut v = Vec::new();
        for entry in self.entries() {
            v.push(format!("{}{}", "  ".repeat(depth), Self::describe(entry)));
            if entry.is_dir() {
                let (sub, _) = Directory::load(cache, entry.sector());
                v.extend(sub.recursive_list(cache, depth + 1));
            }
        }
        v
    }

    /// 每个名字, 它的文件头位置以及文件内容, 调试用
    pub fn print(&self, cache: &Arc<BlockCacheManager>) -> String {
        let mut out = String::from("Directory contents:\n");
        for entry in self.entries() {
            let _ = writeln!(out, "Name: {}, Sector: {}", entry.name(), entry.sector());
            out.push_str(&FileHeader::fetch_from(cache, entry.sector()).print(cache));
        }
        out.push('\n');
        out
    }

    /// 整棵子树中每个普通文件用到的下一层文件头扇区
    pub fn print_use(&self, cache: &Arc<BlockCacheManager>) -> String {
        let mut out = String::new();
        for entry in self.entries() {
            if entry.is_dir() {
                let (sub, _) = Directory::load(cache, entry.sector());
                out.push_str(&sub.print_use(cache));
            } else {
                let hdr = FileHeader::fetch_from(cache, entry.sector());
                let _ = writeln!(
                    out,
                    "Name: {}, Sector: {} {}",
                    entry.name(),
                    entry.sector(),
                    hdr.print_use(cache)
                );
            }
        }
        out
    }
}
