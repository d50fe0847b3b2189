//! 文件系统: 把空闲位图, 根目录和扇区缓存组织在一起, 对外提供基于路径的操作.
//!
//! 磁盘布局:
//!
//! - 扇区 0 ([`FREE_MAP_SECTOR`]) 是空闲位图文件的文件头
//! - 扇区 1 ([`DIRECTORY_SECTOR`]) 是根目录文件的文件头
//! - 其余扇区由空闲位图统一管理, 存放文件头, 下一层文件头和数据
//!
//! 路径都是绝对路径, 例如 `/t0/f1`, 中间的每一段都必须是目录.
//!
//! 这一层不提供崩溃一致性. 新建时先写空闲位图再写目录, 删除时先写目录再写空闲位图,
//! 于是中途崩溃最多留下 "被标记但不可达" 的扇区; [`FileSystem::verify`] 可以把它们找出来.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::{
    Bitmap, BlockCacheManager, BlockDevice, Directory, FileHeader, FreeMap, FsError, OpenFile,
    Result, DIRECTORY_FILE_SIZE, DIRECTORY_SECTOR, FREE_MAP_SECTOR, NUM_DIR_ENTRIES,
    SECTOR_SIZE,
};

pub struct FileSystem {
    cache: Arc<BlockCacheManager>,
    /// 常驻内存的空闲位图, 每次修改之后都会写回位图文件
    free_map: Bitmap,
    free_map_file: OpenFile,
}

/// [`FileSystem::verify`] 的结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// 从根目录可达, 但在空闲位图中是空闲的扇区
    pub reachable_but_free: Vec<u32>,
    /// 在空闲位图中被标记, 但从根目录不可达的扇区
    pub marked_but_unreachable: Vec<u32>,
    /// 被不止一个地方引用的扇区
    pub shared: Vec<u32>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.reachable_but_free.is_empty()
            && self.marked_but_unreachable.is_empty()
            && self.shared.is_empty()
    }
}

/// 把绝对路径拆成各段
fn split_path(path: &str) -> Result<Vec<&str>> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| FsError::InvalidPath(format!("{:?} must start with \"/\"", path)))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(FsError::InvalidPath(format!("{:?} has an empty component", path)));
    }
    Ok(parts)
}

/// 拆成父目录的各段和最后一段
fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut parts = split_path(path)?;
    let name = parts
        .pop()
        .ok_or_else(|| FsError::InvalidPath(format!("{:?} names the root directory", path)))?;
    Ok((parts, name))
}

impl FileSystem {
    /// 在块设备上初始化一个空的文件系统.
    ///
    /// `total_sectors` 必须是 8 的正整数倍, 并且不超过设备的容量.
    pub fn format(block_device: Arc<dyn BlockDevice>, total_sectors: usize) -> Result<Self> {
        if total_sectors < 8 || total_sectors % 8 != 0 {
            return Err(FsError::InvalidGeometry(format!(
                "{} sectors is not a positive multiple of 8",
                total_sectors
            )));
        }
        if total_sectors > block_device.block_count() {
            return Err(FsError::InvalidGeometry(format!(
                "device only has {} sectors",
                block_device.block_count()
            )));
        }

        // 清空整块磁盘
        let zero = [0u8; SECTOR_SIZE];
        for i in 0..total_sectors {
            block_device.write_block(i, &zero);
        }

        let cache = Arc::new(BlockCacheManager::new(block_device));
        let mut free_map = Bitmap::new(total_sectors);
        free_map.mark(FREE_MAP_SECTOR);
        free_map.mark(DIRECTORY_SECTOR);

        let map_len = free_map.byte_len();
        let mut map_hdr = FileHeader::new();
        map_hdr.allocate(&mut free_map, &cache, map_len)?;
        let mut dir_hdr = FileHeader::new();
        dir_hdr.allocate(&mut free_map, &cache, DIRECTORY_FILE_SIZE)?;
        map_hdr.write_back(&cache, FREE_MAP_SECTOR);
        dir_hdr.write_back(&cache, DIRECTORY_SECTOR);

        let free_map_file = OpenFile::new(Arc::clone(&cache), FREE_MAP_SECTOR);
        let directory_file = OpenFile::new(Arc::clone(&cache), DIRECTORY_SECTOR);
        free_map.write_back(&free_map_file);
        Directory::new(NUM_DIR_ENTRIES).write_back(&directory_file);
        cache.sync_all();

        info!(
            "formatted {} sectors, {} free",
            total_sectors,
            free_map.num_clear()
        );
        Ok(Self {
            cache,
            free_map,
            free_map_file,
        })
    }

    /// 打开一个已经格式化过的块设备
    pub fn open(block_device: Arc<dyn BlockDevice>) -> Result<Self> {
        let cache = Arc::new(BlockCacheManager::new(block_device));
        let free_map_file = OpenFile::new(Arc::clone(&cache), FREE_MAP_SECTOR);
        let map_len = free_map_file.length();
        if !free_map_file.header().is_bound() || map_len == 0 {
            return Err(FsError::InvalidGeometry(
                "device does not hold a file system".to_string(),
            ));
        }
        let total_sectors = map_len * 8;
        if total_sectors > cache.block_device().block_count() {
            return Err(FsError::InvalidGeometry(format!(
                "free map covers {} sectors but device has {}",
                total_sectors,
                cache.block_device().block_count()
            )));
        }
        let mut free_map = Bitmap::new(total_sectors);
        free_map.fetch_from(&free_map_file);
        debug!(
            "opened file system of {} sectors, {} free",
            total_sectors,
            free_map.num_clear()
        );
        Ok(Self {
            cache,
            free_map,
            free_map_file,
        })
    }

    pub fn cache(&self) -> &Arc<BlockCacheManager> {
        &self.cache
    }

    pub fn free_map(&self) -> &Bitmap {
        &self.free_map
    }

    pub fn free_sectors(&self) -> usize {
        self.free_map.num_clear()
    }

    /// 把所有缓存的扇区写回设备
    pub fn sync(&self) {
        self.cache.sync_all();
    }

    fn root(&self) -> (Directory, OpenFile) {
        Directory::load(&self.cache, DIRECTORY_SECTOR)
    }

    /// 从根目录出发, 沿着 `parts` 一路打开子目录
    fn walk(&self, parts: &[&str]) -> Result<(Directory, OpenFile)> {
        let (mut dir, mut file) = self.root();
        for &part in parts {
            let sector = dir
                .find(part)
                .ok_or_else(|| FsError::NotFound(part.to_string()))?;
            if !dir.is_dir(part) {
                return Err(FsError::NotADirectory(part.to_string()));
            }
            let (sub, sub_file) = Directory::load(&self.cache, sector);
            dir = sub;
            file = sub_file;
        }
        Ok((dir, file))
    }

    fn persist_free_map(&self) {
        self.free_map.write_back(&self.free_map_file);
        self.cache.sync_all();
    }

    /// 在 `path` 上新建一个 `size` 字节的文件
    pub fn create(&mut self, path: &str, size: usize) -> Result<()> {
        self.create_entry(path, size, false)?;
        info!("create {} ({} bytes)", path, size);
        Ok(())
    }

    /// 在 `path` 上新建一个空目录
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.create_entry(path, DIRECTORY_FILE_SIZE, true)?;
        info!("mkdir {}", path);
        Ok(())
    }

    /// 分配文件头和数据扇区, 并把新文件加入父目录. 任何一步失败都会归还已经拿到的扇区
    fn create_entry(&mut self, path: &str, size: usize, is_dir: bool) -> Result<u32> {
        let (parent, name) = split_parent(path)?;
        let (mut dir, dir_file) = self.walk(&parent)?;
        if dir.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let sector = self.free_map.find_and_set().ok_or(FsError::NoSpace)?;
        let mut hdr = FileHeader::new();
        if let Err(err) = hdr.allocate(&mut self.free_map, &self.cache, size) {
            self.free_map.clear(sector);
            return Err(err);
        }
        if let Err(err) = dir.add(name, sector, is_dir) {
            hdr.deallocate(&mut self.free_map, &self.cache);
            self.free_map.clear(sector);
            return Err(err);
        }
        hdr.write_back(&self.cache, sector);
        if is_dir {
            // 新分配的数据扇区里可能还留着以前的内容
            let file = OpenFile::new(Arc::clone(&self.cache), sector);
            Directory::new(NUM_DIR_ENTRIES).write_back(&file);
        }

        self.persist_free_map();
        dir.write_back(&dir_file);
        self.cache.sync_all();
        Ok(sector)
    }

    /// 打开一个普通文件
    pub fn open_file(&self, path: &str) -> Result<OpenFile> {
        let (parent, name) = split_parent(path)?;
        let (dir, _) = self.walk(&parent)?;
        let sector = dir
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if dir.is_dir(name) {
            return Err(FsError::IsADirectory(name.to_string()));
        }
        Ok(OpenFile::new(Arc::clone(&self.cache), sector))
    }

    /// 删除一个普通文件
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (parent, name) = split_parent(path)?;
        let (mut dir, dir_file) = self.walk(&parent)?;
        let sector = dir
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if dir.is_dir(name) {
            return Err(FsError::IsADirectory(name.to_string()));
        }

        FileHeader::fetch_from(&self.cache, sector).deallocate(&mut self.free_map, &self.cache);
        self.free_map.clear(sector);
        dir.remove(name)?;

        dir.write_back(&dir_file);
        self.cache.sync_all();
        self.persist_free_map();
        info!("remove {}", path);
        Ok(())
    }

    /// 删除一个文件, 或者一个目录以及它下面的整棵子树. `/` 会清空根目录
    pub fn remove_recursive(&mut self, path: &str) -> Result<()> {
        let parts = split_path(path)?;
        let Some((&name, parent)) = parts.split_last() else {
            let (mut root, root_file) = self.root();
            root.recursive_remove(&mut self.free_map, &self.cache);
            root.write_back(&root_file);
            self.cache.sync_all();
            self.persist_free_map();
            warn!("cleared the root directory");
            return Ok(());
        };

        let (mut dir, dir_file) = self.walk(parent)?;
        dir.recursive_remove_entry(name, &mut self.free_map, &self.cache)?;
        dir.write_back(&dir_file);
        self.cache.sync_all();
        self.persist_free_map();
        info!("remove {} recursively", path);
        Ok(())
    }

    fn dir_at(&self, path: &str) -> Result<Directory> {
        let parts = split_path(path)?;
        Ok(self.walk(&parts)?.0)
    }

    /// 列出 `path` 这一层
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.dir_at(path)?.list())
    }

    /// 先序列出 `path` 下面的整棵子树
    pub fn list_recursive(&self, path: &str) -> Result<Vec<String>> {
        Ok(self.dir_at(path)?.recursive_list(&self.cache, 0))
    }

    /// 根目录里每个文件的文件头和内容
    pub fn print(&self) -> String {
        self.root().0.print(&self.cache)
    }

    /// 整棵树中每个普通文件用到的下一层文件头
    pub fn print_use(&self) -> String {
        self.root().0.print_use(&self.cache)
    }

    /// 从根出发收集所有可达扇区, 与空闲位图对比
    pub fn verify(&self) -> ConsistencyReport {
        fn visit(sector: u32, refs: &mut BTreeMap<u32, usize>) {
            *refs.entry(sector).or_insert(0) += 1;
        }

        let mut refs: BTreeMap<u32, usize> = BTreeMap::new();

        for sector in [FREE_MAP_SECTOR, DIRECTORY_SECTOR] {
            visit(sector, &mut refs);
            for owned in FileHeader::fetch_from(&self.cache, sector).sectors(&self.cache) {
                visit(owned, &mut refs);
            }
        }
        let mut pending = vec![self.root().0];
        while let Some(dir) = pending.pop() {
            for entry in dir.entries() {
                visit(entry.sector(), &mut refs);
                let hdr = FileHeader::fetch_from(&self.cache, entry.sector());
                for owned in hdr.sectors(&self.cache) {
                    visit(owned, &mut refs);
                }
                // 被多次引用的目录不再展开, 避免在损坏的树上死循环
                if entry.is_dir() && refs[&entry.sector()] == 1 {
                    pending.push(Directory::load(&self.cache, entry.sector()).0);
                }
            }
        }

        let mut report = ConsistencyReport::default();
        for (&sector, &count) in refs.iter() {
            if count > 1 {
                report.shared.push(sector);
            }
            if !self.free_map.test(sector) {
                report.reachable_but_free.push(sector);
            }
        }
        report.marked_but_unreachable = self
            .free_map
            .marked()
            .into_iter()
            .filter(|sector| !refs.contains_key(sector))
            .collect();
        if !report.is_consistent() {
            warn!("file system is inconsistent: {:?}", report);
        }
        report
    }
}
