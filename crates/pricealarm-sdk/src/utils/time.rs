//! 时间工具
//!
//! 全 SDK 统一使用毫秒时间戳（UTC），既作为挂钟时间，
//! 也作为集合快照的逻辑时钟（StateStore 保证单调递增）。

/// 当前 UTC 毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
