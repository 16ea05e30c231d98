//! 挂载试探: 找到超级块, 同时确定方言与字节序
//!
//! 对每个候选方言, 用它预期的块大小和超级块大小读 SBLOCK_OFFSET 处的超级块,
//! 再把魔数同时按小端和大端解释, 与该方言接受的魔数集合比较 (几个方言的魔数互相重叠,
//! 所以方言和字节序必须一起判定). 如果超级块里记录的碎片大小/超级块大小和试探时用的不一致,
//! 就按修正后的大小重读一次 (只重读一次, 不循环). CD 风格的方言在起点处找不到时,
//! 还会在备用起点再试一次.

use std::sync::Arc;

use log::{debug, info};

use super::{
    dialect::{Dialect, Flavor, StateCheck, CD_ALT_BASE_BLOCKS, SBLOCK_OFFSET},
    endian::{ByteOrder, Codec},
    geometry::check_sizes,
    layout::{SuperBlock, DYNAMIC_POSTBLFMT, FSOK, SBLOCKSIZE, SB_MAGIC_OFFSET, SB_MIN_SIZE},
    BlockDevice, FsError, FsResult,
};

/// 一次成功试探的结果
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    pub flavor: Flavor,
    pub sb: SuperBlock,
    /// 卷起点的字节偏移 (CD 风格卷可能不为 0)
    pub base_bytes: usize,
    /// 最终读超级块使用的块大小, 等于碎片大小
    pub block_size: usize,
    /// 修正性重读的次数, 0 或 1
    pub rereads: u32,
}

pub fn state_offset(dialect: Dialect) -> Option<usize> {
    match dialect.spec().state {
        StateCheck::CleanByte => None,
        StateCheck::SunState(off) => Some(off),
    }
}

/// 以 block_size 为块大小, 读取 base 起点处的 sb_size 字节超级块
fn read_superblock(
    device: &Arc<dyn BlockDevice>,
    base_bytes: usize,
    block_size: usize,
    sb_size: usize,
) -> FsResult<Vec<u8>> {
    let start = base_bytes + SBLOCK_OFFSET;
    let first = start / block_size;
    let count = (sb_size + block_size - 1) / block_size;
    let mut bytes = Vec::with_capacity(count * block_size);
    let mut buf = vec![0u8; block_size];
    for i in 0..count {
        device.read_block(first + i, &mut buf)?;
        bytes.extend_from_slice(&buf);
    }
    bytes.truncate(sb_size);
    Ok(bytes)
}

/// 魔数按哪种字节序解释能被该方言接受
fn match_magic(bytes: &[u8], dialect: Dialect) -> Option<ByteOrder> {
    if bytes.len() < SB_MAGIC_OFFSET + 4 {
        return None;
    }
    [ByteOrder::Little, ByteOrder::Big]
        .into_iter()
        .find(|order| dialect.accepts_magic(Codec::new(*order).get_u32(bytes, SB_MAGIC_OFFSET)))
}

/// 自动试探时用来区分魔数相同的方言
fn fingerprint_matches(dialect: Dialect, sb: &SuperBlock) -> bool {
    match dialect {
        Dialect::Bsd44 => sb.postblformat == DYNAMIC_POSTBLFMT,
        Dialect::Sun | Dialect::SunX86 => sb.state == FSOK.wrapping_sub(sb.time),
        Dialect::Hp => sb.magic != super::dialect::UFS_MAGIC,
        _ => true,
    }
}

fn is_short_read(err: &FsError) -> bool {
    matches!(err, FsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn try_base(
    device: &Arc<dyn BlockDevice>,
    dialect: Dialect,
    base_bytes: usize,
    strict: bool,
) -> FsResult<Option<ProbeOutcome>> {
    let spec = dialect.spec();
    let mut block_size = spec.trial_block_size;
    let mut sb_size = spec.trial_sb_size;
    let mut rereads = 0;
    loop {
        debug!(
            "probe {}: base {} block size {} superblock size {}",
            spec.name, base_bytes, block_size, sb_size
        );
        let bytes = match read_superblock(device, base_bytes, block_size, sb_size) {
            Ok(bytes) => bytes,
            Err(e) if is_short_read(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let order = match match_magic(&bytes, dialect) {
            Some(order) => order,
            None => return Ok(None),
        };
        let codec = Codec::new(order);
        let sb = SuperBlock::decode(&bytes, &codec, state_offset(dialect));
        if !strict && !fingerprint_matches(dialect, &sb) {
            return Ok(None);
        }
        check_sizes(sb.bsize, sb.fsize)?;
        let sbsize = sb.sbsize as usize;
        if !(SB_MIN_SIZE..=SBLOCKSIZE).contains(&sbsize) {
            return Err(FsError::Config(format!("bad superblock size {}", sbsize)));
        }
        if sb.fsize as usize == block_size && sbsize == sb_size {
            return Ok(Some(ProbeOutcome {
                flavor: Flavor::new(dialect, order),
                sb,
                base_bytes,
                block_size,
                rereads,
            }));
        }
        if rereads > 0 {
            return Err(FsError::Config(format!(
                "fragment size {} / superblock size {} still inconsistent after re-read",
                sb.fsize, sbsize
            )));
        }
        info!(
            "probe {}: re-reading superblock with block size {} (was {}), size {} (was {})",
            spec.name, sb.fsize, block_size, sbsize, sb_size
        );
        block_size = sb.fsize as usize;
        sb_size = sbsize;
        rereads += 1;
    }
}

fn try_dialect(
    device: &Arc<dyn BlockDevice>,
    dialect: Dialect,
    strict: bool,
) -> FsResult<Option<ProbeOutcome>> {
    if let Some(found) = try_base(device, dialect, 0, strict)? {
        return Ok(Some(found));
    }
    if dialect.spec().cd_alt_base {
        let alt = CD_ALT_BASE_BLOCKS * dialect.spec().trial_block_size;
        return try_base(device, dialect, alt, strict);
    }
    Ok(None)
}

/// 指定了方言就只试它, 否则按 [`Dialect::ALL`] 的顺序逐个试
pub fn probe(device: &Arc<dyn BlockDevice>, requested: Option<Dialect>) -> FsResult<ProbeOutcome> {
    match requested {
        Some(dialect) => try_dialect(device, dialect, true)?.ok_or_else(|| {
            FsError::Config(format!("bad magic number for ufstype={}", dialect.spec().name))
        }),
        None => {
            for dialect in Dialect::ALL {
                if let Some(found) = try_dialect(device, dialect, false)? {
                    return Ok(found);
                }
            }
            Err(FsError::Config(
                "no UFS superblock found in any dialect or byte order".into(),
            ))
        }
    }
}
