//! 本地存储模块 - 四个同步集合的内存所有者
//!
//! 职责：
//! - 持有各集合的当前本地状态（tokio RwLock）
//! - 变更动作统一入口：改动后刷新逻辑时钟并发布 LocalChanged
//! - 为同步引擎实现 SyncTarget（整体读取 / 整体替换）
//! - 告警集合可挂接 sled 镜像缓存
//!
//! 约定：`apply_remote` 整体替换后只发 RemoteApplied，绝不发
//! LocalChanged——远端来的数据不能再次触发推送。

pub mod cache;
pub mod entities;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{PriceAlarmSDKError, Result};
use crate::events::{SyncEvent, SyncEventBus};
use crate::sync::{CollectionKind, SyncTarget};
use crate::threshold;
use crate::utils::now_ms;
use cache::AlarmCache;
use entities::{
    ActiveAlarm, AlarmCollection, AlarmLevel, AlarmLevelCollection, AlarmLevelConfig, PairMeta,
    PairThresholdSet, ThresholdCollection, ThresholdConfig, WatchlistSnapshot,
};

// ============================================================
// 自选列表
// ============================================================

/// 自选列表存储
#[derive(Debug)]
pub struct WatchlistStore {
    inner: RwLock<WatchlistSnapshot>,
    bus: SyncEventBus,
}

impl WatchlistStore {
    pub fn new(bus: SyncEventBus) -> Self {
        Self {
            inner: RwLock::new(WatchlistSnapshot::default()),
            bus,
        }
    }

    pub async fn get(&self) -> WatchlistSnapshot {
        self.inner.read().await.clone()
    }

    /// 加自选；已存在时仅补充元信息。返回内容是否发生变化
    pub async fn add_pair(&self, pair_id: &str, meta: Option<PairMeta>) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let inserted = inner.items.insert(pair_id.to_string());
            let meta_changed = match meta {
                Some(meta) => inner.pair_meta.insert(pair_id.to_string(), meta.clone())
                    != Some(meta),
                None => false,
            };
            let changed = inserted || meta_changed;
            if changed {
                inner.timestamp = now_ms();
            }
            changed
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Watchlist));
        }
        changed
    }

    /// 移除自选（连同元信息）；不存在是正常的 false
    pub async fn remove_pair(&self, pair_id: &str) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let removed = inner.items.remove(pair_id);
            inner.pair_meta.remove(pair_id);
            if removed {
                inner.timestamp = now_ms();
            }
            removed
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Watchlist));
        }
        changed
    }
}

#[async_trait]
impl SyncTarget for WatchlistStore {
    async fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.inner.read().await.clone())?)
    }

    async fn apply_remote(&self, payload: Value) -> Result<()> {
        let snapshot: WatchlistSnapshot = serde_json::from_value(payload)
            .map_err(|e| PriceAlarmSDKError::InvalidData(format!("自选列表负载非法: {}", e)))?;
        *self.inner.write().await = snapshot;
        self.bus.publish(SyncEvent::RemoteApplied(CollectionKind::Watchlist));
        Ok(())
    }
}

// ============================================================
// 阈值集合
// ============================================================

/// 阈值存储 - pair_id -> PairThresholdSet
///
/// 管理动作委托 threshold 模块的纯函数，本层只负责状态归属、
/// 逻辑时钟与事件发布。
#[derive(Debug)]
pub struct ThresholdStore {
    inner: RwLock<ThresholdCollection>,
    bus: SyncEventBus,
}

impl ThresholdStore {
    pub fn new(bus: SyncEventBus) -> Self {
        Self {
            inner: RwLock::new(ThresholdCollection::default()),
            bus,
        }
    }

    pub async fn get(&self) -> ThresholdCollection {
        self.inner.read().await.clone()
    }

    pub async fn pair(&self, pair_id: &str) -> Option<PairThresholdSet> {
        self.inner.read().await.pairs.get(pair_id).cloned()
    }

    /// 新增阈值；校验负载与 id 在本交易对内的唯一性
    pub async fn add_threshold(&self, pair_id: &str, config: ThresholdConfig) -> Result<()> {
        config.validate()?;
        {
            let mut inner = self.inner.write().await;
            let set = inner
                .pairs
                .entry(pair_id.to_string())
                .or_insert_with(|| PairThresholdSet::empty(pair_id));
            let mut candidate = set.clone();
            candidate.thresholds.push(config);
            candidate.validate()?;
            *set = candidate;
            inner.timestamp = now_ms();
        }
        self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        Ok(())
    }

    /// 整体替换某阈值（update）；id 不存在返回 NotFound
    pub async fn update_threshold(&self, pair_id: &str, config: ThresholdConfig) -> Result<()> {
        config.validate()?;
        {
            let mut inner = self.inner.write().await;
            let set = inner.pairs.get_mut(pair_id).ok_or_else(|| {
                PriceAlarmSDKError::NotFound(format!("交易对无阈值集合: {}", pair_id))
            })?;
            let slot = set
                .thresholds
                .iter_mut()
                .find(|t| t.id == config.id)
                .ok_or_else(|| {
                    PriceAlarmSDKError::NotFound(format!("阈值不存在: {}", config.id))
                })?;
            *slot = config;
            set.validate()?;
            inner.timestamp = now_ms();
        }
        self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        Ok(())
    }

    /// 切换启用/暂停；id 不存在返回 false
    pub async fn toggle_threshold(&self, pair_id: &str, threshold_id: &str) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let toggled = inner.pairs.get_mut(pair_id).and_then(|set| {
                set.thresholds
                    .iter_mut()
                    .find(|t| t.id == threshold_id)
                    .map(|t| *t = threshold::toggle_active(t))
            });
            if toggled.is_some() {
                inner.timestamp = now_ms();
                true
            } else {
                false
            }
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        }
        changed
    }

    /// 删除单个阈值；不存在是正常的 false，不是错误
    pub async fn delete_threshold(&self, pair_id: &str, threshold_id: &str) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let removed = match inner.pairs.get_mut(pair_id) {
                Some(set) => {
                    let (next, removed) = threshold::delete_threshold(set, threshold_id);
                    *set = next;
                    removed
                }
                None => false,
            };
            if removed {
                inner.timestamp = now_ms();
            }
            removed
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        }
        changed
    }

    /// 清空某交易对的全部阈值；键保留（空集合是有意义的状态）
    pub async fn delete_all_for_pair(&self, pair_id: &str) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let emptied = match inner.pairs.get_mut(pair_id) {
                Some(set) if !set.thresholds.is_empty() => {
                    *set = threshold::delete_all_for_pair(set);
                    true
                }
                _ => false,
            };
            if emptied {
                inner.timestamp = now_ms();
            }
            emptied
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        }
        changed
    }

    /// 批量清空多个交易对的阈值；所有键保留
    pub async fn batch_delete(&self, pair_ids: &[&str]) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            let before = inner.pairs.clone();
            inner.pairs = threshold::batch_delete(&before, pair_ids);
            let changed = inner.pairs != before;
            if changed {
                inner.timestamp = now_ms();
            }
            changed
        };
        if changed {
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::Thresholds));
        }
        changed
    }

    /// "已配置"阈值数（可解析数值且至少一个通知方向）
    pub async fn configured_count(&self, pair_id: &str) -> usize {
        self.inner
            .read()
            .await
            .pairs
            .get(pair_id)
            .map(|set| threshold::configured_count(&set.thresholds))
            .unwrap_or(0)
    }
}

#[async_trait]
impl SyncTarget for ThresholdStore {
    async fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.inner.read().await.clone())?)
    }

    async fn apply_remote(&self, payload: Value) -> Result<()> {
        let collection: ThresholdCollection = serde_json::from_value(payload)
            .map_err(|e| PriceAlarmSDKError::InvalidData(format!("阈值集合负载非法: {}", e)))?;
        for set in collection.pairs.values() {
            set.validate()?;
        }
        *self.inner.write().await = collection;
        self.bus.publish(SyncEvent::RemoteApplied(CollectionKind::Thresholds));
        Ok(())
    }
}

// ============================================================
// 告警级别配置
// ============================================================

/// 告警级别投递策略存储（全局共享）
#[derive(Debug)]
pub struct AlarmLevelStore {
    inner: RwLock<AlarmLevelCollection>,
    bus: SyncEventBus,
}

impl AlarmLevelStore {
    /// 以出厂默认策略初始化
    pub fn new(bus: SyncEventBus) -> Self {
        Self {
            inner: RwLock::new(AlarmLevelCollection::with_defaults()),
            bus,
        }
    }

    pub async fn get(&self) -> AlarmLevelCollection {
        self.inner.read().await.clone()
    }

    /// 某级别的策略；远端数据缺失该级别时回落出厂默认
    pub async fn level(&self, level: AlarmLevel) -> AlarmLevelConfig {
        self.inner
            .read()
            .await
            .levels
            .get(&level)
            .cloned()
            .unwrap_or_else(|| AlarmLevelConfig::default_for(level))
    }

    /// 更新某级别的策略
    pub async fn set_level(&self, config: AlarmLevelConfig) {
        {
            let mut inner = self.inner.write().await;
            inner.levels.insert(config.level, config);
            inner.timestamp = now_ms();
        }
        self.bus.publish(SyncEvent::LocalChanged(CollectionKind::AlarmLevels));
    }
}

#[async_trait]
impl SyncTarget for AlarmLevelStore {
    async fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.inner.read().await.clone())?)
    }

    async fn apply_remote(&self, payload: Value) -> Result<()> {
        let collection: AlarmLevelCollection = serde_json::from_value(payload).map_err(|e| {
            PriceAlarmSDKError::InvalidData(format!("级别配置负载非法: {}", e))
        })?;
        *self.inner.write().await = collection;
        self.bus.publish(SyncEvent::RemoteApplied(CollectionKind::AlarmLevels));
        Ok(())
    }
}

// ============================================================
// 正在触发的告警
// ============================================================

/// 告警集合存储
///
/// 可选挂接 sled 镜像缓存：每次变更（含远端替换）尽力写一份，
/// 客户端重启后先渲染缓存内容，再等首次拉取。
#[derive(Debug)]
pub struct AlarmStore {
    inner: RwLock<AlarmCollection>,
    bus: SyncEventBus,
    mirror: Option<Arc<AlarmCache>>,
}

impl AlarmStore {
    pub fn new(bus: SyncEventBus) -> Self {
        Self {
            inner: RwLock::new(AlarmCollection::default()),
            bus,
            mirror: None,
        }
    }

    /// 带镜像缓存的构造：启动时回填上次已知的告警集合
    pub fn with_mirror(bus: SyncEventBus, mirror: Arc<AlarmCache>) -> Self {
        let initial = mirror.load().unwrap_or_default();
        if !initial.alarms.is_empty() {
            debug!("从镜像缓存回填 {} 条告警", initial.alarms.len());
        }
        Self {
            inner: RwLock::new(initial),
            bus,
            mirror: Some(mirror),
        }
    }

    fn save_mirror(&self, collection: &AlarmCollection) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.save(collection) {
                warn!("写入告警镜像缓存失败: {}", e);
            }
        }
    }

    pub async fn get(&self) -> AlarmCollection {
        self.inner.read().await.clone()
    }

    pub async fn alarm(&self, id: &str) -> Option<ActiveAlarm> {
        self.inner.read().await.alarms.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.alarms.len()
    }

    /// 插入新告警；负载在边界校验
    pub async fn insert(&self, alarm: ActiveAlarm) -> Result<()> {
        alarm.validate()?;
        let collection = {
            let mut inner = self.inner.write().await;
            inner.alarms.insert(alarm.id.clone(), alarm);
            inner.timestamp = now_ms();
            inner.clone()
        };
        self.save_mirror(&collection);
        self.bus.publish(SyncEvent::LocalChanged(CollectionKind::ActiveAlarms));
        Ok(())
    }

    /// 按 id 删除；幂等：首个调用方 true，其后一律 false
    pub async fn remove(&self, id: &str) -> bool {
        let (removed, collection) = {
            let mut inner = self.inner.write().await;
            let removed = inner.alarms.remove(id).is_some();
            if removed {
                inner.timestamp = now_ms();
            }
            (removed, inner.clone())
        };
        if removed {
            self.save_mirror(&collection);
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::ActiveAlarms));
        }
        removed
    }

    /// 原地修改某条告警（重复通知簿记用）；id 不存在返回 false
    pub async fn mutate<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ActiveAlarm),
    {
        let (mutated, collection) = {
            let mut inner = self.inner.write().await;
            let mutated = match inner.alarms.get_mut(id) {
                Some(alarm) => {
                    f(alarm);
                    true
                }
                None => false,
            };
            if mutated {
                inner.timestamp = now_ms();
            }
            (mutated, inner.clone())
        };
        if mutated {
            self.save_mirror(&collection);
            self.bus.publish(SyncEvent::LocalChanged(CollectionKind::ActiveAlarms));
        }
        mutated
    }
}

#[async_trait]
impl SyncTarget for AlarmStore {
    async fn snapshot(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.inner.read().await.clone())?)
    }

    async fn apply_remote(&self, payload: Value) -> Result<()> {
        let collection: AlarmCollection = serde_json::from_value(payload)
            .map_err(|e| PriceAlarmSDKError::InvalidData(format!("告警集合负载非法: {}", e)))?;
        for alarm in collection.alarms.values() {
            alarm.validate()?;
        }
        {
            *self.inner.write().await = collection.clone();
        }
        self.save_mirror(&collection);
        self.bus.publish(SyncEvent::RemoteApplied(CollectionKind::ActiveAlarms));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::TriggerFrequency;
    use serde_json::json;
    use tempfile::TempDir;

    fn threshold(id: &str) -> ThresholdConfig {
        ThresholdConfig {
            id: id.to_string(),
            threshold_value: "50000".to_string(),
            notify_on_increase: true,
            notify_on_decrease: false,
            increase_frequency: TriggerFrequency::Once,
            decrease_frequency: TriggerFrequency::Once,
            alarm_level: AlarmLevel::Caution,
            note: String::new(),
            is_active: Some(true),
        }
    }

    fn alarm(id: &str) -> ActiveAlarm {
        ActiveAlarm {
            id: id.to_string(),
            instrument_name: "BTCUSDT".to_string(),
            threshold_value: "50000".to_string(),
            alarm_level: AlarmLevel::Caution,
            triggered_at: 1,
            message: "crossed".to_string(),
            note: String::new(),
            threshold_id: None,
            pair_id: None,
            requires_approval: false,
            repetitions_completed: None,
            repetitions_total: None,
            auto_dismiss_at: None,
            last_notified_at: None,
            sequence_ms: None,
            channels: None,
        }
    }

    #[tokio::test]
    async fn test_watchlist_mutation_emits_local_changed() {
        let bus = SyncEventBus::new(16);
        let mut rx = bus.subscribe();
        let store = WatchlistStore::new(bus);

        assert!(store.add_pair("BTCUSDT", None).await);
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::LocalChanged(CollectionKind::Watchlist)
        );
        // 重复添加无变化，不发事件
        assert!(!store.add_pair("BTCUSDT", None).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watchlist_apply_remote_emits_remote_applied_only() {
        let bus = SyncEventBus::new(16);
        let mut rx = bus.subscribe();
        let store = WatchlistStore::new(bus);

        store
            .apply_remote(json!({"items": ["SOLUSDT"], "pairMeta": {}, "timestamp": 5}))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::RemoteApplied(CollectionKind::Watchlist)
        );
        assert!(rx.try_recv().is_err());
        assert!(store.get().await.items.contains("SOLUSDT"));
    }

    #[tokio::test]
    async fn test_threshold_store_unique_ids_enforced() {
        let store = ThresholdStore::new(SyncEventBus::new(16));
        store.add_threshold("BTCUSDT", threshold("t1")).await.unwrap();
        let dup = store.add_threshold("BTCUSDT", threshold("t1")).await;
        assert!(dup.is_err());
        assert_eq!(store.pair("BTCUSDT").await.unwrap().thresholds.len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_store_delete_all_keeps_key() {
        let store = ThresholdStore::new(SyncEventBus::new(16));
        for i in 0..5 {
            store
                .add_threshold("BTCUSDT", threshold(&format!("t{}", i)))
                .await
                .unwrap();
        }
        assert!(store.delete_all_for_pair("BTCUSDT").await);
        let set = store.pair("BTCUSDT").await.unwrap();
        assert_eq!(set.thresholds.len(), 0);
        assert_eq!(set.pair_id, "BTCUSDT");
        // 再清一次：已空，无变化
        assert!(!store.delete_all_for_pair("BTCUSDT").await);
    }

    #[tokio::test]
    async fn test_threshold_store_batch_delete() {
        let store = ThresholdStore::new(SyncEventBus::new(16));
        for (pair, n) in [("A", 3), ("B", 2), ("C", 4)] {
            for i in 0..n {
                store
                    .add_threshold(pair, threshold(&format!("{}-{}", pair, i)))
                    .await
                    .unwrap();
            }
        }
        assert!(store.batch_delete(&["A", "C"]).await);
        let all = store.get().await;
        assert_eq!(all.pairs.len(), 3);
        assert_eq!(all.pairs["A"].thresholds.len(), 0);
        assert_eq!(all.pairs["B"].thresholds.len(), 2);
        assert_eq!(all.pairs["C"].thresholds.len(), 0);
    }

    #[tokio::test]
    async fn test_threshold_store_toggle_and_count() {
        let store = ThresholdStore::new(SyncEventBus::new(16));
        store.add_threshold("BTCUSDT", threshold("t1")).await.unwrap();
        assert_eq!(store.configured_count("BTCUSDT").await, 1);
        assert!(store.toggle_threshold("BTCUSDT", "t1").await);
        let set = store.pair("BTCUSDT").await.unwrap();
        assert_eq!(set.thresholds[0].is_active, Some(false));
        // 暂停不影响"已配置"计数
        assert_eq!(store.configured_count("BTCUSDT").await, 1);
        assert!(!store.toggle_threshold("BTCUSDT", "missing").await);
    }

    #[tokio::test]
    async fn test_alarm_store_idempotent_remove() {
        let store = AlarmStore::new(SyncEventBus::new(16));
        store.insert(alarm("a1")).await.unwrap();
        store.insert(alarm("a2")).await.unwrap();
        assert_eq!(store.count().await, 2);

        // 首次删除成功且数量减一
        assert!(store.remove("a1").await);
        assert_eq!(store.count().await, 1);
        // 再次删除同一 id：false，数量不变
        assert!(!store.remove("a1").await);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_alarm_store_rejects_malformed() {
        let store = AlarmStore::new(SyncEventBus::new(16));
        let mut bad = alarm("");
        bad.id = "".to_string();
        assert!(store.insert(bad).await.is_err());
        assert_eq!(store.count().await, 0);

        // 远端负载中的畸形告警同样在边界被拒
        let payload = json!({
            "alarms": {"x": {"id": "x", "instrumentName": " ", "thresholdValue": "1",
                "alarmLevel": "caution", "triggeredAt": 1, "message": "m",
                "requiresApproval": false}},
            "timestamp": 1
        });
        assert!(store.apply_remote(payload).await.is_err());
    }

    #[tokio::test]
    async fn test_alarm_store_mirror_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mirror = Arc::new(AlarmCache::open(dir.path()).unwrap());

        {
            let store = AlarmStore::with_mirror(SyncEventBus::new(16), mirror.clone());
            store.insert(alarm("a1")).await.unwrap();
        }
        // "重启"后先从镜像回填
        let store = AlarmStore::with_mirror(SyncEventBus::new(16), mirror);
        assert!(store.alarm("a1").await.is_some());
    }

    #[tokio::test]
    async fn test_level_store_falls_back_to_defaults() {
        let store = AlarmLevelStore::new(SyncEventBus::new(16));
        // 远端替换为空集合后，读取仍能回落出厂默认
        store
            .apply_remote(json!({"levels": {}, "timestamp": 9}))
            .await
            .unwrap();
        let cfg = store.level(AlarmLevel::VeryDangerous).await;
        assert!(cfg.requires_approval);
    }
}
