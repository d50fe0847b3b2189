//! 一个教学用文件系统的磁盘存储层.
//!
//! 从下往上:
//!
//! - 扇区设备 ([`fs::BlockDevice`]) 与扇区缓存 ([`fs::BlockCacheManager`])
//! - 空闲位图 ([`fs::Bitmap`])
//! - 文件头 ([`fs::FileHeader`]): 按文件大小自适应嵌套的多级索引
//! - 目录 ([`fs::Directory`]): 目录本身也是文件, 支持整棵子树的递归操作
//! - 基于路径的文件系统 ([`fs::FileSystem`])

pub mod device;
pub mod fs;
