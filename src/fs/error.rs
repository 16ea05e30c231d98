//! 错误分类
//!
//! | 类别 | 变体 | errno |
//! |------|------|-------|
//! | 配置/几何参数 | `Config` | `EINVAL` |
//! | 元数据损坏 | `Corrupted` | `EIO` |
//! | 资源耗尽 | `NoSpace` / `DirectoryFull` / `TooManyLinks` | `ENOSPC` / `EFBIG` / `EMLINK` |
//! | 查找/插入 | `NotFound` / `Exists` | `ENOENT` / `EEXIST` |
//! | 名字空间 | `NotEmpty` / `NotDirectory` / `IsDirectory` / `InvalidName` / `Invalid` | ... |
//! | 只读 | `ReadOnly` | `EROFS` |
//! | 块设备 I/O | `Io` | `EIO` |
//!
//! 损坏类错误永远不会在底层被吞掉, 它们一路冒泡到操作的调用者,
//! 并经过 [`UfsFileSystem::check`](super::UfsFileSystem::check) 把卷标记为坏并强制只读.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// 挂载期的几何参数/配置错误, 挂载直接失败
    #[error("configuration error: {0}")]
    Config(String),

    /// 磁盘上的元数据不满足不变量
    #[error("corrupted {what}: {detail}")]
    Corrupted { what: &'static str, detail: String },

    #[error("no space left on device")]
    NoSpace,

    /// 目录已经用完了直接块能寻址的全部空间
    #[error("directory cannot grow any further")]
    DirectoryFull,

    #[error("too many links")]
    TooManyLinks,

    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("invalid name: {0}")]
    InvalidName(String),

    /// 参数本身合法但操作不成立, 比如把目录移到它自己的子树里
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("read-only file system")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn corrupted(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupted {
            what,
            detail: detail.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }

    /// 宿主层使用的 POSIX errno
    pub fn errno(&self) -> i32 {
        match self {
            Self::Config(_) => 22,
            Self::Corrupted { .. } => 5,
            Self::NoSpace => 28,
            Self::DirectoryFull => 27,
            Self::TooManyLinks => 31,
            Self::NotFound => 2,
            Self::Exists => 17,
            Self::NotEmpty => 39,
            Self::NotDirectory => 20,
            Self::IsDirectory => 21,
            Self::InvalidName(_) => 36,
            Self::Invalid(_) => 22,
            Self::ReadOnly => 30,
            Self::Io(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_is_classified() {
        let err = FsError::corrupted("cylinder group", "bad magic 0x0");
        assert!(err.is_corruption());
        assert_eq!(err.errno(), 5);
        assert_eq!(
            err.to_string(),
            "corrupted cylinder group: bad magic 0x0"
        );
        assert!(!FsError::NoSpace.is_corruption());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: FsError = io.into();
        assert_eq!(err.errno(), 5);
        assert!(!err.is_corruption());
    }
}
