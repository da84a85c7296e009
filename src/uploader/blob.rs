// 待上传的二进制对象
//
// 文件内容只通过 BlobSource 句柄按区间读取：特征值计算一次读一个窗口，
// 上传一次读一个分片，任何时候都不会把整个文件读进内存。

use async_trait::async_trait;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 读取失败
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("读取区间越界: {start}..{end}, 文件大小 {size}")]
    OutOfRange { start: u64, end: u64, size: u64 },

    #[error("文件读取失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 可按区间读取的二进制对象
#[async_trait]
pub trait BlobSource: Send + Sync + fmt::Debug {
    /// 总字节数
    fn size(&self) -> u64;

    /// 读取 `[range.start, range.end)` 的字节
    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, ReadError>;
}

fn check_range(range: &Range<u64>, size: u64) -> Result<(), ReadError> {
    if range.start > range.end || range.end > size {
        return Err(ReadError::OutOfRange {
            start: range.start,
            end: range.end,
            size,
        });
    }
    Ok(())
}

/// 内存中的二进制对象
#[derive(Clone)]
pub struct MemoryBlob {
    data: Arc<[u8]>,
}

impl MemoryBlob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            data: Arc::from(data.into_boxed_slice()),
        }
    }
}

impl fmt::Debug for MemoryBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlob")
            .field("size", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl BlobSource for MemoryBlob {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, ReadError> {
        check_range(&range, self.size())?;
        Ok(self.data[range.start as usize..range.end as usize].to_vec())
    }
}

/// 本地文件
///
/// 大小在打开时确定，之后每次读取重新打开文件并定位。
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: PathBuf,
    size: u64,
}

impl FileBlob {
    /// 打开本地文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if metadata.is_dir() {
            return Err(ReadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("不支持上传目录: {:?}", path),
            )));
        }
        Ok(Self {
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlobSource for FileBlob {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>, ReadError> {
        check_range(&range, self.size)?;

        let mut file = File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(range.start)).await?;

        let mut buffer = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buffer).await?;

        debug!(
            "读取文件区间: path={:?}, bytes={}-{}, 大小={} bytes",
            self.path,
            range.start,
            range.end,
            buffer.len()
        );

        Ok(buffer)
    }
}

/// 待上传文件
///
/// 克隆只复制句柄，不复制内容。
#[derive(Clone)]
pub struct UploadFile {
    /// 任务ID（同一文件的预计算与上传共用）
    pub id: String,
    /// 文件名
    pub name: String,
    /// 内容
    pub blob: Arc<dyn BlobSource>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size())
            .finish()
    }
}

impl UploadFile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, blob: Arc<dyn BlobSource>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            blob,
        }
    }

    /// 由内存数据构造
    pub fn from_bytes(id: impl Into<String>, name: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(id, name, Arc::new(MemoryBlob::new(data)))
    }

    /// 由本地路径构造，任务ID自动生成
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let path = path.as_ref();
        let blob = FileBlob::open(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        Ok(Self::new(uuid::Uuid::new_v4().to_string(), name, Arc::new(blob)))
    }

    pub fn size(&self) -> u64 {
        self.blob.size()
    }
}
