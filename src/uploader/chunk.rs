// 上传分片管理
//
// 分片规则：
// - 分片数 = ceil(文件大小 / 分片大小)，空文件没有分片
// - 最后一个分片可以不足分片大小
// - 分片名 = {特征值}_{序号}.{扩展名}，序号从 1 开始
// - 文件名没有扩展名时使用 tmp

use crate::uploader::task::percent;
use std::collections::HashSet;
use std::ops::Range;
use tracing::debug;

/// 无扩展名文件使用的分片扩展名
pub const FALLBACK_EXTENSION: &str = "tmp";

/// 计算分片数量
pub fn total_chunks(size: u64, chunk_size: u64) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as usize
}

/// 取文件扩展名（最后一个点之后的部分）
pub fn chunk_extension(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => FALLBACK_EXTENSION,
    }
}

/// 生成分片名
///
/// # 参数
/// * `fingerprint` - 文件特征值
/// * `index` - 分片序号（从 1 开始）
/// * `extension` - 扩展名
pub fn chunk_name(fingerprint: &str, index: usize, extension: &str) -> String {
    format!("{}_{}.{}", fingerprint, index, extension)
}

/// 上传分片信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// 分片序号（从 1 开始）
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 分片名
    pub name: String,
    /// 是否已完成（上传成功或服务端已存在）
    pub completed: bool,
}

impl UploadChunk {
    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 上传分片管理器
#[derive(Debug, Clone)]
pub struct UploadChunkManager {
    chunks: Vec<UploadChunk>,
}

impl UploadChunkManager {
    /// 创建分片管理器
    ///
    /// # 参数
    /// * `total_size` - 文件总大小
    /// * `chunk_size` - 分片大小
    /// * `fingerprint` - 文件特征值
    /// * `filename` - 文件名（取扩展名）
    pub fn new(total_size: u64, chunk_size: u64, fingerprint: &str, filename: &str) -> Self {
        let extension = chunk_extension(filename);
        let chunks = Self::calculate_chunks(total_size, chunk_size)
            .into_iter()
            .enumerate()
            .map(|(i, range)| UploadChunk {
                index: i + 1,
                name: chunk_name(fingerprint, i + 1, extension),
                range,
                completed: false,
            })
            .collect::<Vec<_>>();

        debug!(
            "创建上传分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Self { chunks }
    }

    /// 计算分片区间
    fn calculate_chunks(total_size: u64, chunk_size: u64) -> Vec<Range<u64>> {
        let mut ranges = Vec::with_capacity(total_chunks(total_size, chunk_size));
        if chunk_size == 0 {
            return ranges;
        }

        let mut offset = 0u64;
        while offset < total_size {
            let end = std::cmp::min(offset + chunk_size, total_size);
            ranges.push(offset..end);
            offset = end;
        }
        ranges
    }

    /// 按服务端返回的已上传分片名标记完成
    ///
    /// # 返回
    /// 新标记的分片数量
    pub fn mark_existing(&mut self, names: &[String]) -> usize {
        let names: HashSet<&str> = names.iter().map(String::as_str).collect();
        let mut marked = 0;
        for chunk in self.chunks.iter_mut() {
            if !chunk.completed && names.contains(chunk.name.as_str()) {
                chunk.completed = true;
                marked += 1;
            }
        }
        marked
    }

    /// 标记分片为已完成（按序号）
    pub fn mark_completed(&mut self, index: usize) {
        if let Some(chunk) = self.chunks.iter_mut().find(|c| c.index == index) {
            chunk.completed = true;
        }
    }

    /// 待上传的分片
    pub fn pending(&self) -> Vec<UploadChunk> {
        self.chunks.iter().filter(|c| !c.completed).cloned().collect()
    }

    pub fn chunks(&self) -> &[UploadChunk] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn completed_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.completed).count()
    }

    /// 按分片数计算进度，保留两位小数
    pub fn progress(&self) -> f64 {
        percent(self.completed_count(), self.chunk_count())
    }

    pub fn is_completed(&self) -> bool {
        self.chunks.iter().all(|c| c.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_12mb_file_with_5mb_chunks() {
        let manager = UploadChunkManager::new(12 * MB, 5 * MB, "abc", "movie.mp4");
        assert_eq!(manager.chunk_count(), 3);

        let sizes: Vec<u64> = manager.chunks().iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![5 * MB, 5 * MB, 2 * MB]);

        let names: Vec<&str> = manager.chunks().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["abc_1.mp4", "abc_2.mp4", "abc_3.mp4"]);
    }

    #[test]
    fn test_extension() {
        assert_eq!(chunk_extension("archive.tar.gz"), "gz");
        assert_eq!(chunk_extension("README"), "tmp");
        assert_eq!(chunk_extension("trailing."), "tmp");
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let manager = UploadChunkManager::new(0, 5 * MB, "abc", "empty.txt");
        assert_eq!(manager.chunk_count(), 0);
        assert!(manager.is_completed());
        assert_eq!(manager.progress(), 100.0);
    }

    #[test]
    fn test_mark_existing() {
        let mut manager = UploadChunkManager::new(12 * MB, 5 * MB, "abc", "movie.mp4");
        let marked = manager.mark_existing(&[
            "abc_1.mp4".to_string(),
            "abc_3.mp4".to_string(),
            "other_9.mp4".to_string(),
        ]);

        assert_eq!(marked, 2);
        assert_eq!(manager.progress(), 66.67);

        let pending = manager.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 2);

        manager.mark_completed(2);
        assert!(manager.is_completed());
    }

    proptest! {
        #[test]
        fn prop_partition_covers_file_exactly_once(
            size in 0u64..10_000,
            chunk_size in 1u64..2_000,
        ) {
            let manager = UploadChunkManager::new(size, chunk_size, "fp", "f.bin");
            let chunks = manager.chunks();

            prop_assert_eq!(chunks.len(), size.div_ceil(chunk_size) as usize);
            prop_assert_eq!(chunks.len(), total_chunks(size, chunk_size));

            let mut offset = 0u64;
            for chunk in chunks {
                prop_assert_eq!(chunk.range.start, offset);
                prop_assert!(chunk.size() > 0);
                prop_assert!(chunk.size() <= chunk_size);
                offset = chunk.range.end;
            }
            prop_assert_eq!(offset, size);
        }
    }
}
