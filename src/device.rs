use crate::fs::{BlockDevice, SECTOR_SIZE};
use log::warn;
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::Mutex,
};

/// 用宿主机上的一个文件来模拟一块磁盘.
///
/// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的,
/// 在访问一个特定的扇区的时候, 我们必须先 seek 到这个扇区的开头位置.
pub struct BlockFile {
    file: Mutex<File>,
    /// 打开时确定的扇区数, 之后不再变化
    sectors: usize,
}

impl BlockFile {
    /// 把 `file` 截断/扩展为 `sectors` 个扇区大小, 内容全部为 0
    pub fn create(file: File, sectors: usize) -> std::io::Result<Self> {
        file.set_len(0)?;
        file.set_len((sectors * SECTOR_SIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }

    /// 直接使用一个已经格式化过的镜像文件, 扇区数由文件长度决定
    pub fn open(file: File) -> std::io::Result<Self> {
        let len = file.metadata()?.len() as usize;
        if len % SECTOR_SIZE != 0 {
            warn!(
                "image length {} is not a whole number of sectors, ignoring the tail",
                len
            );
        }
        Ok(Self {
            file: Mutex::new(file),
            sectors: len / SECTOR_SIZE,
        })
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("Error when seeking!");
        file.read_exact(&mut buf[..SECTOR_SIZE])
            .expect("Not a complete sector");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * SECTOR_SIZE) as u64))
            .expect("Error when seeking!");
        file.write_all(&buf[..SECTOR_SIZE])
            .expect("Not a complete sector");
    }

    fn block_count(&self) -> usize {
        self.sectors
    }
}

/// 纯内存的磁盘, 用于测试
pub struct RamDisk(Mutex<Vec<u8>>);

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self(Mutex::new(vec![0; sectors * SECTOR_SIZE]))
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let disk = self.0.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        buf[..SECTOR_SIZE].copy_from_slice(&disk[start..start + SECTOR_SIZE]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut disk = self.0.lock().unwrap();
        let start = block_id * SECTOR_SIZE;
        disk[start..start + SECTOR_SIZE].copy_from_slice(&buf[..SECTOR_SIZE]);
    }

    fn block_count(&self) -> usize {
        self.0.lock().unwrap().len() / SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_file_reads_back_written_sector() {
        let file = tempfile::tempfile().unwrap();
        let disk = BlockFile::create(file, 4).unwrap();
        assert_eq!(disk.block_count(), 4);

        disk.write_block(2, &[0x55; SECTOR_SIZE]);
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_block(3, &mut buf);
        assert_eq!(buf, [0u8; SECTOR_SIZE]);
        disk.read_block(2, &mut buf);
        assert_eq!(buf, [0x55; SECTOR_SIZE]);
    }

    #[test]
    fn opened_image_reports_its_sector_count() {
        let image = tempfile::NamedTempFile::new().unwrap();
        BlockFile::create(image.reopen().unwrap(), 6).unwrap();
        let disk = BlockFile::open(image.reopen().unwrap()).unwrap();
        assert_eq!(disk.block_count(), 6);

        // 不足一个扇区的尾巴不计入
        let ragged = tempfile::tempfile().unwrap();
        ragged.set_len((3 * SECTOR_SIZE + 5) as u64).unwrap();
        assert_eq!(BlockFile::open(ragged).unwrap().block_count(), 3);
    }

    #[test]
    #[should_panic]
    fn reading_past_the_end_panics() {
        let file = tempfile::tempfile().unwrap();
        let disk = BlockFile::create(file, 1).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_block(1, &mut buf);
    }
}
