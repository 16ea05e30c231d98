//! 方言表
//!
//! 历史上各家 UFS 的磁盘格式互不相同 (超级块试探参数, 目录项格式, 状态字位置, 是否可写),
//! 一个驱动同时支持多种方言, 在挂载时选定. 方言与字节序合在一起构成 [`Flavor`],
//! 作为不可变配置值传给每个组件的构造函数.

use std::collections::HashMap;

use lazy_static::*;

use super::endian::{ByteOrder, Codec};

pub const UFS_MAGIC: u32 = 0x0001_1954;
pub const UFS_MAGIC_BW: u32 = 0x0f24_2697;
pub const UFS_MAGIC_LFN: u32 = 0x0009_5014;
pub const UFS_MAGIC_FEA: u32 = 0x0019_5612;
pub const UFS_MAGIC_4GB: u32 = 0x0523_1994;

/// 超级块相对卷起点的字节偏移
pub const SBLOCK_OFFSET: usize = 8192;

/// CD 风格方言的备用起点: 向后偏移这么多个试探块
pub const CD_ALT_BASE_BLOCKS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    Old,
    Bsd44,
    Sun,
    SunX86,
    NextStep,
    NextStepCd,
    Hp,
}

/// 目录项头部格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirFormat {
    /// ino:u32, reclen:u16, namlen:u16
    Old,
    /// ino:u32, reclen:u16, type:u8, namlen:u8
    Bsd44,
}

/// 状态字所在的位置, 用于判断卷是否干净卸载
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCheck {
    /// 只看 fs_clean
    CleanByte,
    /// fs_state == FSOK - fs_time, 状态字位于给定字节偏移
    SunState(usize),
}

#[derive(Debug)]
pub struct DialectSpec {
    pub name: &'static str,
    /// 第一次试探读超级块时使用的块大小
    pub trial_block_size: usize,
    pub trial_sb_size: usize,
    pub dir_format: DirFormat,
    pub read_only: bool,
    pub cd_alt_base: bool,
    pub state: StateCheck,
    pub magics: &'static [u32],
}

static PLAIN_MAGICS: [u32; 1] = [UFS_MAGIC];
static HP_MAGICS: [u32; 5] = [UFS_MAGIC, UFS_MAGIC_LFN, UFS_MAGIC_FEA, UFS_MAGIC_4GB, UFS_MAGIC_BW];

static SPECS: [DialectSpec; 7] = [
    DialectSpec {
        name: "old",
        trial_block_size: 1024,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: true,
        cd_alt_base: false,
        state: StateCheck::CleanByte,
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "44bsd",
        trial_block_size: 512,
        trial_sb_size: 1536,
        dir_format: DirFormat::Bsd44,
        read_only: false,
        cd_alt_base: false,
        state: StateCheck::CleanByte,
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "sun",
        trial_block_size: 1024,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: false,
        cd_alt_base: false,
        state: StateCheck::SunState(1332),
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "sunx86",
        trial_block_size: 1024,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: false,
        cd_alt_base: false,
        state: StateCheck::SunState(132),
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "nextstep",
        trial_block_size: 1024,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: true,
        cd_alt_base: true,
        state: StateCheck::CleanByte,
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "nextstep-cd",
        trial_block_size: 2048,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: true,
        cd_alt_base: true,
        state: StateCheck::CleanByte,
        magics: &PLAIN_MAGICS,
    },
    DialectSpec {
        name: "hp",
        trial_block_size: 1024,
        trial_sb_size: 2048,
        dir_format: DirFormat::Old,
        read_only: true,
        cd_alt_base: false,
        state: StateCheck::CleanByte,
        magics: &HP_MAGICS,
    },
];

lazy_static! {
    static ref DIALECT_BY_NAME: HashMap<&'static str, Dialect> = Dialect::ALL
        .iter()
        .map(|dialect| (dialect.spec().name, *dialect))
        .collect();
}

impl Dialect {
    /// 自动试探时的顺序
    ///
    /// old 排在 nextstep 前面: 起点处的普通魔数卷一律按 old 挂载,
    /// nextstep 只在备用起点上被自动识别.
    pub const ALL: [Dialect; 7] = [
        Dialect::Bsd44,
        Dialect::Sun,
        Dialect::SunX86,
        Dialect::Hp,
        Dialect::Old,
        Dialect::NextStep,
        Dialect::NextStepCd,
    ];

    pub fn spec(self) -> &'static DialectSpec {
        let idx = match self {
            Dialect::Old => 0,
            Dialect::Bsd44 => 1,
            Dialect::Sun => 2,
            Dialect::SunX86 => 3,
            Dialect::NextStep => 4,
            Dialect::NextStepCd => 5,
            Dialect::Hp => 6,
        };
        &SPECS[idx]
    }

    pub fn from_name(name: &str) -> Option<Dialect> {
        DIALECT_BY_NAME.get(name).copied()
    }

    pub fn names() -> Vec<&'static str> {
        Dialect::ALL.iter().map(|d| d.spec().name).collect()
    }

    pub fn accepts_magic(self, magic: u32) -> bool {
        self.spec().magics.contains(&magic)
    }
}

/// 一次挂载的不可变方言配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flavor {
    pub dialect: Dialect,
    pub codec: Codec,
}

impl Flavor {
    pub fn new(dialect: Dialect, order: ByteOrder) -> Self {
        Self {
            dialect,
            codec: Codec::new(order),
        }
    }

    pub fn dir_format(&self) -> DirFormat {
        self.dialect.spec().dir_format
    }

    pub fn order(&self) -> ByteOrder {
        self.codec.order()
    }
}
