mod bitmap;
mod block_cache;
mod block_dev;
mod directory;
mod error;
mod filesys;
mod layout;
mod vfs;

/// Use a sector size of 128 bytes
pub const SECTOR_SIZE: usize = 128;
/// 为了避免在扇区缓存上浪费过多内存, 内存中同时只能驻留有限个扇区的缓冲区
pub const BLOCK_CACHE_SIZE: usize = 16;
/// 一个文件头中扇区指针表的容量: 文件头恰好占满一个扇区
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 2 * std::mem::size_of::<i32>()) / 4;
/// 文件头最多嵌套的层数, 0 表示指针表直接指向数据扇区
pub const MAX_DEPTH: usize = 3;
/// The max length of a name inside one directory
pub const NAME_LENGTH_LIMIT: usize = 9;
/// 目录项的大小
pub const DIRENT_SIZE: usize = 16;
/// 新建目录的默认容量
pub const NUM_DIR_ENTRIES: usize = 64;
/// 目录文件的大小
pub const DIRECTORY_FILE_SIZE: usize = NUM_DIR_ENTRIES * DIRENT_SIZE;
/// 空闲位图文件的文件头所在扇区
pub const FREE_MAP_SECTOR: u32 = 0;
/// 根目录文件的文件头所在扇区
pub const DIRECTORY_SECTOR: u32 = 1;

pub use bitmap::{Bitmap, FreeMap};
pub use block_cache::{BlockCache, BlockCacheManager};
pub use block_dev::BlockDevice;
pub use directory::Directory;
pub use error::{FsError, Result};
pub use filesys::{ConsistencyReport, FileSystem};
pub use layout::*;
pub use vfs::OpenFile;
