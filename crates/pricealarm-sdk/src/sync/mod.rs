//! 多端状态同步模块
//!
//! 职责：
//! - 每个集合一个 SyncEngine，负责拉取/合并/推送循环
//! - 首次同步时做一次双向合并（MergeResolver），之后只做
//!   按时间戳的单向整体替换（last-writer-wins）
//! - 通过内容哈希与守卫标志抑制"推回刚拉到的数据"反馈回路
//!
//! ## NOTE: 首次合并与后续替换的不对称是刻意的
//!
//! The two-way merge happens exactly once, at initial sync, so edits made
//! before the first pull completes are not wiped out. Every later tick is a
//! one-way whole-value replacement. Do NOT "fix" this into a symmetric
//! merge on every tick; that changes observable behavior.

pub mod engine;
pub mod merge;
pub mod store;

pub use engine::{SyncEngine, SyncEngineConfig, SyncState, TimerSlot};
pub use merge::{canonicalize, content_hash, merge_initial, semantic_eq};
pub use store::{MemoryStateStore, RemoteSnapshot, StateStore};

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// 被同步的四个逻辑集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// 自选列表（集合语义，首次同步做成员并集）
    Watchlist,
    /// 各交易对的阈值集合（整体 LWW）
    Thresholds,
    /// 告警级别投递策略（整体 LWW）
    AlarmLevels,
    /// 正在触发的告警（整体 LWW）
    ActiveAlarms,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Watchlist => "watchlist",
            CollectionKind::Thresholds => "thresholds",
            CollectionKind::AlarmLevels => "alarm_levels",
            CollectionKind::ActiveAlarms => "active_alarms",
        }
    }

    pub fn all() -> [CollectionKind; 4] {
        [
            CollectionKind::Watchlist,
            CollectionKind::Thresholds,
            CollectionKind::AlarmLevels,
            CollectionKind::ActiveAlarms,
        ]
    }
}

/// 同步引擎操作的本地集合视图
///
/// 引擎对负载内容不做假设，统一以 JSON 值整体读取/整体替换；
/// 各本地存储实现该 trait。`apply_remote` 替换后只发 RemoteApplied
/// 事件，绝不发 LocalChanged。
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// 读取当前本地内容（调用时刻的现值，不是创建时的快照）
    async fn snapshot(&self) -> Result<Value>;

    /// 用远端负载整体替换本地内容
    async fn apply_remote(&self, payload: Value) -> Result<()>;
}
