//! 打开的文件: 内存中的 [`FileHeader`] 加上一个读写位置.
//!
//! 文件的读写作用在字节序列的一段区间上, 每个扇区通过 `byte_to_sector` 翻译出物理位置.
//! 文件的大小在创建时就固定了, 写操作不会让文件变长.

use std::sync::Arc;

use super::{BlockCacheManager, FileHeader, SECTOR_SIZE};

type DataBlock = [u8; SECTOR_SIZE];

pub struct OpenFile {
    /// 文件头所在扇区
    sector: u32,
    hdr: FileHeader,
    seek_position: usize,
    cache: Arc<BlockCacheManager>,
}

impl OpenFile {
    pub fn new(cache: Arc<BlockCacheManager>, sector: u32) -> Self {
        let hdr = FileHeader::fetch_from(&cache, sector);
        Self {
            sector,
            hdr,
            seek_position: 0,
            cache,
        }
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn header(&self) -> &FileHeader {
        &self.hdr
    }

    pub fn length(&self) -> usize {
        self.hdr.file_length()
    }

    pub fn seek(&mut self, position: usize) {
        self.seek_position = position;
    }

    /// 从当前位置读, 并把位置往后移
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = self.read_at(buf, self.seek_position);
        self.seek_position += len;
        len
    }

    /// 从当前位置写, 并把位置往后移
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let len = self.write_at(buf, self.seek_position);
        self.seek_position += len;
        len
    }

    /// 从 `position` 开始读, 返回实际读到的字节数, 读到文件末尾为止
    pub fn read_at(&self, buf: &mut [u8], position: usize) -> usize {
        let mut start = position;
        let end = (position + buf.len()).min(self.length());
        if start >= end {
            return 0;
        }
        let mut read_size = 0usize;
        loop {
            // 当前扇区的结束位置
            let end_current_block = ((start / SECTOR_SIZE + 1) * SECTOR_SIZE).min(end);
            let block_read_size = end_current_block - start;
            let dst = &mut buf[read_size..read_size + block_read_size];
            let sector = self.hdr.byte_to_sector(&self.cache, start);
            self.cache
                .get_block_cache(sector as usize)
                .lock()
                .read(0, |data_block: &DataBlock| {
                    let src = &data_block
                        [start % SECTOR_SIZE..start % SECTOR_SIZE + block_read_size];
                    dst.copy_from_slice(src);
                });
            read_size += block_read_size;
            if end_current_block == end {
                break;
            }
            start = end_current_block;
        }
        read_size
    }

    /// 从 `position` 开始写, 超出文件大小的部分被丢弃, 返回实际写入的字节数
    pub fn write_at(&self, buf: &[u8], position: usize) -> usize {
        let mut start = position;
        let end = (position + buf.len()).min(self.length());
        if start >= end {
            return 0;
        }
        let mut write_size = 0usize;
        loop {
            let end_current_block = ((start / SECTOR_SIZE + 1) * SECTOR_SIZE).min(end);
            let block_write_size = end_current_block - start;
            let sector = self.hdr.byte_to_sector(&self.cache, start);
            self.cache
                .get_block_cache(sector as usize)
                .lock()
                .modify(0, |data_block: &mut DataBlock| {
                    let src = &buf[write_size..write_size + block_write_size];
                    let dst = &mut data_block
                        [start % SECTOR_SIZE..start % SECTOR_SIZE + block_write_size];
                    dst.copy_from_slice(src);
                });
            write_size += block_write_size;
            if end_current_block == end {
                break;
            }
            start = end_current_block;
        }
        write_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::fs::{Bitmap, FreeMap};

    fn new_file(size: usize) -> (Bitmap, OpenFile) {
        let cache = Arc::new(BlockCacheManager::new(Arc::new(RamDisk::new(512))));
        let mut map = Bitmap::new(512);
        let hdr_sector = map.find_and_set().unwrap();
        let mut hdr = FileHeader::new();
        hdr.allocate(&mut map, &cache, size).unwrap();
        hdr.write_back(&cache, hdr_sector);
        (map, OpenFile::new(cache, hdr_sector))
    }

    #[test]
    fn write_then_read_across_nested_headers() {
        let size = 3840 + 1000;
        let (_, file) = new_file(size);
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write_at(&data, 0), size);

        let mut back = vec![0u8; size];
        assert_eq!(file.read_at(&mut back, 0), size);
        assert_eq!(back, data);

        let mut middle = [0u8; 300];
        assert_eq!(file.read_at(&mut middle, 3700), 300);
        assert_eq!(&middle[..], &data[3700..4000]);
    }

    #[test]
    fn writes_are_clamped_to_file_length() {
        let (_, file) = new_file(200);
        assert_eq!(file.write_at(&[7u8; 100], 150), 50);
        assert_eq!(file.write_at(&[7u8; 10], 200), 0);
        let mut buf = [0u8; 64];
        assert_eq!(file.read_at(&mut buf, 190), 10);
    }

    #[test]
    fn sequential_read_and_write_advance_position() {
        let (_, mut file) = new_file(20);
        assert_eq!(file.write(b"hello "), 6);
        assert_eq!(file.write(b"world"), 5);
        file.seek(0);
        let mut buf = [0u8; 11];
        assert_eq!(file.read(&mut buf), 11);
        assert_eq!(&buf, b"hello world");
    }
}
