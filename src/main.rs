use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    process,
    sync::Arc,
};

use clap::Parser;
use log::error;

use sector_fs::device::BlockFile;
use sector_fs::fs::{FileSystem, Result};

mod cli;

use cli::{Cli, Command};

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("{:?}", err);
        eprintln!("sector-fs: {}", err);
        process::exit(1);
    }
}

fn open_fs(cli: &Cli) -> Result<FileSystem> {
    let file = OpenOptions::new().read(true).write(true).open(&cli.image)?;
    FileSystem::open(Arc::new(BlockFile::open(file)?))
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Format { sectors } => {
            // 在宿主机上创建镜像文件来模拟一块磁盘, 访问权限设置为可读可写
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&cli.image)?;
            let disk = BlockFile::create(file, *sectors)?;
            let fs = FileSystem::format(Arc::new(disk), *sectors)?;
            println!(
                "{}: {} sectors, {} free",
                cli.image.display(),
                sectors,
                fs.free_sectors()
            );
        }
        Command::Copy { host, path } => {
            let mut fs = open_fs(&cli)?;
            let mut data = Vec::new();
            File::open(host)?.read_to_end(&mut data)?;
            fs.create(path, data.len())?;
            let written = fs.open_file(path)?.write_at(&data, 0);
            fs.sync();
            println!("{} -> {} ({} bytes)", host.display(), path, written);
        }
        Command::Cat { path } => {
            let fs = open_fs(&cli)?;
            let file = fs.open_file(path)?;
            let mut buf = vec![0u8; file.length()];
            file.read_at(&mut buf, 0);
            std::io::stdout().write_all(&buf)?;
        }
        Command::Mkdir { path } => {
            open_fs(&cli)?.mkdir(path)?;
        }
        Command::Ls { path, recursive } => {
            let fs = open_fs(&cli)?;
            let names = if *recursive {
                fs.list_recursive(path)?
            } else {
                fs.list(path)?
            };
            for name in names {
                println!("{}", name);
            }
        }
        Command::Rm { path, recursive } => {
            let mut fs = open_fs(&cli)?;
            if *recursive {
                fs.remove_recursive(path)?;
            } else {
                fs.remove(path)?;
            }
        }
        Command::Dump => {
            print!("{}", open_fs(&cli)?.print());
        }
        Command::Usage => {
            print!("{}", open_fs(&cli)?.print_use());
        }
        Command::Check => {
            let fs = open_fs(&cli)?;
            let report = fs.verify();
            if report.is_consistent() {
                println!("consistent, {} free sectors", fs.free_sectors());
            } else {
                println!("{:#?}", report);
                process::exit(2);
            }
        }
    }
    Ok(())
}
