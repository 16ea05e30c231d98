use std::{path::Path, sync::Arc};

use chrono::Local;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{LevelFilter, Metadata, Record};

use device::BlockFile;
use fs::{
    format, BlockDevice, ByteOrder, Dialect, FormatParams, FsError, FsResult, Inode, InodeKind,
    MountOptions, UfsFileSystem, FS_BAD, FS_CLEAN,
};

mod device;
mod fs;

/// 把日志打到标准错误上, 级别由 -v 的个数决定
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{} [{:>5}] {}",
                Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn cli() -> Command {
    let image = || Arg::new("image").required(true).help("Filesystem image file");
    let path = |name: &'static str| Arg::new(name).required(true).help("Absolute path inside the image");
    Command::new("ufs-meta")
        .about("Inspect and edit BSD UFS images")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("More logging (-v info, -vv debug)"),
        )
        .arg(
            Arg::new("type")
                .short('t')
                .long("type")
                .global(true)
                .help("ufstype: old, 44bsd, sun, sunx86, nextstep, nextstep-cd, hp"),
        )
        .arg(
            Arg::new("sync")
                .long("sync")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Write metadata through on every change"),
        )
        .subcommand(
            Command::new("format")
                .about("Write a fresh filesystem")
                .arg(image())
                .arg(
                    Arg::new("endian")
                        .short('e')
                        .long("endian")
                        .value_parser(["little", "big"])
                        .help("Byte order (default: host)"),
                )
                .arg(num_arg("bsize", "4096", "Block size"))
                .arg(num_arg("fsize", "1024", "Fragment size"))
                .arg(num_arg("ncg", "4", "Number of cylinder groups"))
                .arg(num_arg("ipg", "128", "Inodes per group"))
                .arg(num_arg("fpg", "2048", "Fragments per group"))
                .arg(
                    Arg::new("alt-base")
                        .long("alt-base")
                        .action(ArgAction::SetTrue)
                        .help("Place the volume at the CD-style alternate base"),
                )
                .arg(
                    Arg::new("old-cg")
                        .long("old-cg")
                        .action(ArgAction::SetTrue)
                        .help("Write old-format cylinder group descriptors"),
                ),
        )
        .subcommand(Command::new("info").about("Show superblock and summary").arg(image()))
        .subcommand(
            Command::new("ls")
                .about("List a directory")
                .arg(image())
                .arg(Arg::new("path").default_value("/")),
        )
        .subcommand(Command::new("mkdir").about("Make a directory").arg(image()).arg(path("path")))
        .subcommand(Command::new("touch").about("Create an empty file").arg(image()).arg(path("path")))
        .subcommand(Command::new("rm").about("Remove a file").arg(image()).arg(path("path")))
        .subcommand(Command::new("rmdir").about("Remove an empty directory").arg(image()).arg(path("path")))
        .subcommand(
            Command::new("mv")
                .about("Rename or move an entry")
                .arg(image())
                .arg(path("from"))
                .arg(path("to")),
        )
}

fn num_arg(name: &'static str, default: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(value_parser!(u32))
        .default_value(default)
        .help(help)
}

fn main() {
    let matches = cli().get_matches();
    let verbosity = match matches.subcommand() {
        Some((_, sub)) => sub.get_count("verbose").max(matches.get_count("verbose")),
        None => matches.get_count("verbose"),
    };
    init_logger(verbosity);
    if let Err(e) = run(&matches) {
        eprintln!("ufs-meta: {}", e);
        std::process::exit(e.errno());
    }
}

fn dialect_arg(matches: &ArgMatches) -> FsResult<Option<Dialect>> {
    match matches.get_one::<String>("type") {
        None => Ok(None),
        Some(name) => Dialect::from_name(name).map(Some).ok_or_else(|| {
            FsError::Config(format!(
                "unknown ufstype {} (one of: {})",
                name,
                Dialect::names().join(", ")
            ))
        }),
    }
}

fn image_arg(matches: &ArgMatches) -> FsResult<&String> {
    matches
        .get_one::<String>("image")
        .ok_or_else(|| FsError::Config("missing image".into()))
}

fn path_arg<'a>(matches: &'a ArgMatches, name: &str) -> FsResult<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| FsError::Config(format!("missing {}", name)))
}

// 全局参数的值会传播到子命令的 ArgMatches 里, 统一从子命令上取
fn mount(sub: &ArgMatches, read_only: bool) -> FsResult<Arc<UfsFileSystem>> {
    let file = BlockFile::open(image_arg(sub)?, !read_only)?;
    let opts = MountOptions {
        dialect: dialect_arg(sub)?,
        read_only,
        synchronous: sub.get_flag("sync"),
    };
    UfsFileSystem::mount(Arc::new(file), opts)
}

/// "/a/b/c" -> ("/a/b", "c")
fn split_path(path: &str) -> FsResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        _ if !trimmed.is_empty() && !trimmed.contains('/') => Ok(("", trimmed)),
        _ => Err(FsError::InvalidName(path.to_string())),
    }
}

fn parent_of<'a>(fs: &Arc<UfsFileSystem>, path: &'a str) -> FsResult<(Inode, &'a str)> {
    let (parent, name) = split_path(path)?;
    Ok((UfsFileSystem::resolve(fs, parent)?, name))
}

fn run(matches: &ArgMatches) -> FsResult<()> {
    match matches.subcommand() {
        Some(("format", sub)) => format_cmd(sub),
        Some(("info", sub)) => info_cmd(&mount(sub, true)?),
        Some(("ls", sub)) => {
            let fs = mount(sub, true)?;
            let dir = UfsFileSystem::resolve(&fs, path_arg(sub, "path")?)?;
            for item in dir.entries()? {
                let stat = Inode::new(item.ino, Arc::clone(&fs)).stat()?;
                println!(
                    "{:>6} {:>10} {:>6o} {:>3} {:>8} {}",
                    item.ino,
                    format!("{:?}", stat.kind),
                    stat.perm,
                    stat.nlink,
                    stat.size,
                    item.name_lossy()
                );
            }
            Ok(())
        }
        Some(("mkdir", sub)) => {
            let fs = mount(sub, false)?;
            let (parent, name) = parent_of(&fs, path_arg(sub, "path")?)?;
            parent.mkdir(name, 0o755).map(|_| ())
        }
        Some(("touch", sub)) => {
            let fs = mount(sub, false)?;
            let (parent, name) = parent_of(&fs, path_arg(sub, "path")?)?;
            match parent.create(name, InodeKind::File, 0o644) {
                Ok(_) | Err(FsError::Exists) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Some(("rm", sub)) => {
            let fs = mount(sub, false)?;
            let (parent, name) = parent_of(&fs, path_arg(sub, "path")?)?;
            parent.unlink(name)
        }
        Some(("rmdir", sub)) => {
            let fs = mount(sub, false)?;
            let (parent, name) = parent_of(&fs, path_arg(sub, "path")?)?;
            parent.rmdir(name)
        }
        Some(("mv", sub)) => {
            let fs = mount(sub, false)?;
            let (from_dir, from) = parent_of(&fs, path_arg(sub, "from")?)?;
            let (to_dir, to) = parent_of(&fs, path_arg(sub, "to")?)?;
            from_dir.rename(from, &to_dir, to)
        }
        _ => Err(FsError::Config("unknown subcommand".into())),
    }
}

fn format_cmd(sub: &ArgMatches) -> FsResult<()> {
    let num = |name: &str| sub.get_one::<u32>(name).copied().unwrap_or_default();
    let order = match sub.get_one::<String>("endian").map(String::as_str) {
        Some("big") => ByteOrder::Big,
        Some(_) => ByteOrder::Little,
        None => ByteOrder::host(),
    };
    let params = FormatParams {
        dialect: dialect_arg(sub)?.unwrap_or(Dialect::Bsd44),
        order,
        bsize: num("bsize"),
        fsize: num("fsize"),
        ncg: num("ncg"),
        ipg: num("ipg"),
        fpg: num("fpg"),
        alt_base: sub.get_flag("alt-base"),
        magic: None,
        old_cg_format: sub.get_flag("old-cg"),
    };
    let image = image_arg(sub)?;
    let file = BlockFile::create(Path::new(image), params.image_len()? as u64)?;
    let device: Arc<dyn BlockDevice> = Arc::new(file);
    format(&device, &params)?;
    println!(
        "{}: {} filesystem, {} groups, {} inodes",
        image,
        params.dialect.spec().name,
        params.ncg,
        params.ncg * params.ipg
    );
    Ok(())
}

fn info_cmd(fs: &Arc<UfsFileSystem>) -> FsResult<()> {
    let flavor = fs.flavor();
    let geo = fs.geometry();
    let sb = fs.superblock();
    let total = fs.totals();
    println!("dialect:      {}", flavor.dialect.spec().name);
    println!("byte order:   {}", flavor.order().name());
    println!("magic:        {:#x}", sb.magic);
    println!("base:         {} bytes", fs.base_bytes());
    println!("bsize/fsize:  {}/{}", geo.bsize, geo.fsize);
    println!("groups:       {} x {} frags, {} inodes", geo.ncg, geo.fpg, geo.ipg);
    let state = match sb.clean {
        FS_CLEAN => "clean",
        FS_BAD => "bad",
        0 => "active",
        _ => "other",
    };
    println!("state:        {} ({:#x})", state, sb.clean);
    println!("read-only:    {}", fs.is_read_only());
    println!("re-reads:     {}", fs.superblock_rereads());
    println!(
        "free:         {} blocks, {} frags, {} inodes, {} dirs",
        total.nbfree, total.nffree, total.nifree, total.ndir
    );
    for cgx in 0..geo.ncg {
        let cs = fs.group_summary(cgx);
        println!(
            "  group {:>3}: {:>6} blocks {:>6} inodes free, {:>4} dirs",
            cgx, cs.nbfree, cs.nifree, cs.ndir
        );
    }
    Ok(())
}

#[test]
fn image_file_round_trip() -> FsResult<()> {
    let path = std::env::temp_dir().join(format!("ufs-meta-{}.img", std::process::id()));
    let params = FormatParams::default();
    {
        let file = BlockFile::create(&path, params.image_len()? as u64)?;
        let device: Arc<dyn BlockDevice> = Arc::new(file);
        format(&device, &params)?;
        let fs = UfsFileSystem::mount(device, MountOptions::default())?;
        let root = UfsFileSystem::root_inode(&fs);
        root.mkdir("etc", 0o755)?.create("passwd", InodeKind::File, 0o644)?;
    }
    {
        let file = BlockFile::open(&path, false)?;
        let fs = UfsFileSystem::mount(
            Arc::new(file),
            MountOptions {
                read_only: true,
                ..MountOptions::default()
            },
        )?;
        let passwd = UfsFileSystem::resolve(&fs, "/etc/passwd")?;
        assert_eq!(passwd.kind()?, InodeKind::File);
        assert_eq!(split_path("/etc/passwd")?, ("/etc", "passwd"));
        assert_eq!(split_path("top")?, ("", "top"));
        assert!(split_path("/").is_err());
    }
    std::fs::remove_file(&path)?;
    Ok(())
}
