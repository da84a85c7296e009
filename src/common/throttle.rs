//! 进度节流器
//!
//! 控制进度通知的发送频率：同一节流器在一个间隔内最多放行一次，
//! 最后一次（完成时）通过 `force_emit` 强制放行。
//! 特征值计算的窗口进度、分片上传进度都经过它。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;

/// 进度节流器
///
/// 时间戳以节流器创建时刻为基准，节流器可以在线程之间移动。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 基准时刻
    origin: Instant,
    /// 上次放行距基准的纳秒数，0 表示尚未放行
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建新的节流器
    ///
    /// # 参数
    /// * `interval` - 最小放行间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查本次是否应该放行
    ///
    /// 第一次调用总是放行；之后距离上次放行超过间隔才放行
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（最后一次更新）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
        true
    }

    /// 普通更新走节流，最后一次强制放行
    pub fn should_emit_or_final(&self, is_final: bool) -> bool {
        if is_final {
            self.force_emit()
        } else {
            self.should_emit()
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        // 保证非 0，0 保留给"尚未放行"
        (self.origin.elapsed().as_nanos() as u64).max(1)
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
