//! StateStore 接口 - 后端按集合的 get/put 端点
//!
//! 每个集合一个槽位：GET 返回 `{payload, timestamp}` 或"不存在"；
//! PUT 提交负载并返回分配的时间戳。时间戳是跨端可比的单调逻辑时钟，
//! 挂钟毫秒是可接受的实现。
//!
//! SDK 只依赖该 trait；真实后端（HTTP 等）在宿主侧实现。
//! `MemoryStateStore` 是进程内实现，供测试与本地单机模式使用。

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::sync::merge::with_timestamp;
use crate::sync::CollectionKind;
use crate::utils::now_ms;

/// 远端快照
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub payload: Value,
    pub timestamp: i64,
}

/// 后端状态存储接口
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 拉取集合快照；集合从未被写入时返回 None
    async fn fetch(&self, kind: CollectionKind) -> Result<Option<RemoteSnapshot>>;

    /// 整体写入集合负载，返回分配的时间戳
    async fn store(&self, kind: CollectionKind, payload: Value) -> Result<i64>;
}

/// 进程内 StateStore 实现
///
/// 分配 `max(now_ms, 上次+1)` 的时间戳，时钟回拨也保持严格单调；
/// 写入时把分配值同步回负载顶层 timestamp，保证内嵌逻辑时钟一致。
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slots: RwLock<HashMap<CollectionKind, RemoteSnapshot>>,
    last_timestamp: RwLock<i64>,
    put_count: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 累计 PUT 次数（反馈回路测试用）
    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::SeqCst)
    }

    async fn next_timestamp(&self) -> i64 {
        let mut last = self.last_timestamp.write().await;
        let candidate = now_ms().max(*last + 1);
        *last = candidate;
        candidate
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn fetch(&self, kind: CollectionKind) -> Result<Option<RemoteSnapshot>> {
        let slots = self.slots.read().await;
        Ok(slots.get(&kind).cloned())
    }

    async fn store(&self, kind: CollectionKind, payload: Value) -> Result<i64> {
        let timestamp = self.next_timestamp().await;
        let stamped = with_timestamp(&payload, timestamp);
        let mut slots = self.slots.write().await;
        slots.insert(
            kind,
            RemoteSnapshot {
                payload: stamped,
                timestamp,
            },
        );
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(timestamp)
    }
}
