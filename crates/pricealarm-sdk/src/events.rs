//! 事件系统模块 - 集合变更的广播与订阅
//!
//! 功能包括：
//! - 本地变更事件（驱动防抖推送）
//! - 远端替换事件（UI 刷新用）
//! - 推送完成事件
//! - 基于 tokio broadcast 的多订阅者分发
//!
//! 本地存储是事件的唯一发布方；同步引擎和宿主 UI 是订阅方。
//! `apply_remote` 只发 `RemoteApplied`，绝不发 `LocalChanged`，
//! 这是防止"推回刚拉到的数据"反馈回路的第一道闸门。

use tokio::sync::broadcast;
use tracing::debug;

use crate::sync::CollectionKind;

/// 同步相关事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// 本地状态因远端替换以外的原因发生变化
    LocalChanged(CollectionKind),
    /// 远端快照已整体替换本地状态
    RemoteApplied(CollectionKind),
    /// 一次推送成功，携带 StateStore 分配的时间戳
    Pushed {
        kind: CollectionKind,
        timestamp: i64,
    },
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct SyncEventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    /// 创建事件总线，capacity 为滞后订阅者可积压的事件数
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 发布事件；没有订阅者不是错误
    pub fn publish(&self, event: SyncEvent) {
        if let Err(e) = self.tx.send(event.clone()) {
            debug!("事件无订阅者，丢弃: {:?}", e.0);
            return;
        }
        debug!("事件已发布: {:?}", event);
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
