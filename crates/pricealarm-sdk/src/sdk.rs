//! SDK 编排层 - 组装事件总线、本地存储、生命周期管理与四个同步引擎
//!
//! 职责：
//! - 按配置构建全部子系统并接线
//! - start：各集合引擎独立启动（首轮 initial_sync + 拉取循环），
//!   并启动自动消除清扫任务（按 sweep_interval 周期调用
//!   `AlarmLifecycleManager::sweep_auto_dismiss`）
//! - shutdown：统一取消所有引擎的定时器任务与清扫任务
//!
//! 宿主契约：追加通知的节奏由宿主的投递器驱动——每发出一次
//! 通知调用一次 `lifecycle().record_repetition(id)`；SDK 只负责
//! 簿记与到期清扫，不做投递。
//!
//! 四个引擎彼此独立：某个集合的慢拉取只延迟它自己的节拍，
//! 不阻塞其他集合，也不阻塞内存状态的读写。集合间不提供
//! 跨集合原子性，各集合独立收敛。

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::alarm::AlarmLifecycleManager;
use crate::error::Result;
use crate::events::{SyncEvent, SyncEventBus};
use crate::storage::cache::AlarmCache;
use crate::storage::{AlarmLevelStore, AlarmStore, ThresholdStore, WatchlistStore};
use crate::sync::{CollectionKind, StateStore, SyncEngine, SyncEngineConfig, SyncTarget};

/// SDK 配置
#[derive(Debug, Clone)]
pub struct PriceAlarmConfig {
    /// 告警镜像缓存目录；None 则不落盘
    pub cache_dir: Option<PathBuf>,
    /// 同步引擎时序参数
    pub sync: SyncEngineConfig,
    /// 事件总线容量
    pub event_capacity: usize,
    /// 自动消除清扫间隔
    pub sweep_interval: Duration,
}

impl Default for PriceAlarmConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            sync: SyncEngineConfig::default(),
            event_capacity: 256,
            sweep_interval: Duration::from_millis(1000),
        }
    }
}

impl PriceAlarmConfig {
    pub fn builder() -> PriceAlarmConfigBuilder {
        PriceAlarmConfigBuilder::default()
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct PriceAlarmConfigBuilder {
    cache_dir: Option<PathBuf>,
    sync: Option<SyncEngineConfig>,
    event_capacity: Option<usize>,
    sweep_interval: Option<Duration>,
}

impl PriceAlarmConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn sync(mut self, config: SyncEngineConfig) -> Self {
        self.sync = Some(config);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn build(self) -> PriceAlarmConfig {
        let defaults = PriceAlarmConfig::default();
        PriceAlarmConfig {
            cache_dir: self.cache_dir,
            sync: self.sync.unwrap_or(defaults.sync),
            event_capacity: self.event_capacity.unwrap_or(defaults.event_capacity),
            sweep_interval: self.sweep_interval.unwrap_or(defaults.sweep_interval),
        }
    }
}

/// SDK 实例
pub struct PriceAlarmSDK {
    bus: SyncEventBus,
    watchlist: Arc<WatchlistStore>,
    thresholds: Arc<ThresholdStore>,
    levels: Arc<AlarmLevelStore>,
    alarms: Arc<AlarmStore>,
    lifecycle: AlarmLifecycleManager,
    engines: Vec<Arc<SyncEngine>>,
    sweep_interval: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl PriceAlarmSDK {
    /// 组装 SDK；StateStore 由宿主注入（真实后端或 MemoryStateStore）
    pub fn initialize(
        store: Arc<dyn StateStore>,
        config: PriceAlarmConfig,
    ) -> Result<Arc<Self>> {
        let capacity = if config.event_capacity == 0 {
            256
        } else {
            config.event_capacity
        };
        let bus = SyncEventBus::new(capacity);

        let watchlist = Arc::new(WatchlistStore::new(bus.clone()));
        let thresholds = Arc::new(ThresholdStore::new(bus.clone()));
        let levels = Arc::new(AlarmLevelStore::new(bus.clone()));
        let alarms = Arc::new(match &config.cache_dir {
            Some(dir) => {
                let mirror = Arc::new(AlarmCache::open(dir)?);
                AlarmStore::with_mirror(bus.clone(), mirror)
            }
            None => AlarmStore::new(bus.clone()),
        });

        let lifecycle = AlarmLifecycleManager::new(alarms.clone(), levels.clone());

        let engines = CollectionKind::all()
            .into_iter()
            .map(|kind| {
                let target: Arc<dyn SyncTarget> = match kind {
                    CollectionKind::Watchlist => watchlist.clone(),
                    CollectionKind::Thresholds => thresholds.clone(),
                    CollectionKind::AlarmLevels => levels.clone(),
                    CollectionKind::ActiveAlarms => alarms.clone(),
                };
                SyncEngine::new(kind, target, store.clone(), bus.clone(), config.sync.clone())
            })
            .collect();

        Ok(Arc::new(Self {
            bus,
            watchlist,
            thresholds,
            levels,
            alarms,
            lifecycle,
            engines,
            sweep_interval: config.sweep_interval,
            sweep_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }))
    }

    /// 启动全部集合引擎与自动消除清扫任务（重复调用是 no-op）
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for engine in &self.engines {
            Arc::clone(engine).start();
        }

        // 清扫任务：到期的非 requires_approval 告警自动消除
        let lifecycle = self.lifecycle.clone();
        let interval = self.sweep_interval;
        let sweep = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let removed = lifecycle.sweep_auto_dismiss(crate::utils::now_ms()).await;
                if !removed.is_empty() {
                    info!("清扫任务移除 {} 条到期告警", removed.len());
                }
            }
        });
        if let Some(old) = self.sweep_task.lock().replace(sweep) {
            old.abort();
        }
        info!("SDK 已启动，{} 个集合引擎运行中", self.engines.len());
    }

    /// 停止全部引擎、清扫任务并取消所有挂起的定时器
    pub fn shutdown(&self) {
        for engine in &self.engines {
            engine.shutdown();
        }
        if let Some(sweep) = self.sweep_task.lock().take() {
            sweep.abort();
        }
        info!("SDK 已停止");
    }

    pub fn watchlist(&self) -> &Arc<WatchlistStore> {
        &self.watchlist
    }

    pub fn thresholds(&self) -> &Arc<ThresholdStore> {
        &self.thresholds
    }

    pub fn alarm_levels(&self) -> &Arc<AlarmLevelStore> {
        &self.levels
    }

    pub fn alarms(&self) -> &Arc<AlarmStore> {
        &self.alarms
    }

    pub fn lifecycle(&self) -> &AlarmLifecycleManager {
        &self.lifecycle
    }

    /// 订阅事件流（宿主 UI 刷新用）
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{AlarmLevel, ThresholdConfig, TriggerFrequency};
    use crate::sync::MemoryStateStore;
    use crate::threshold::{evaluate, PriceSample};
    use std::time::Duration;

    fn fast_config() -> PriceAlarmConfig {
        PriceAlarmConfig::builder()
            .sync(SyncEngineConfig {
                poll_interval: Duration::from_millis(50),
                settle_delay: Duration::from_millis(30),
                debounce_window: Duration::from_millis(10),
                push_min_interval: Duration::from_millis(20),
                retry_buffer: Duration::from_millis(5),
            })
            .sweep_interval(Duration::from_millis(20))
            .build()
    }

    fn threshold() -> ThresholdConfig {
        ThresholdConfig {
            id: "t1".to_string(),
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

    #[tokio::test]
    async fn test_approval_on_one_device_removes_everywhere() {
        let store = Arc::new(MemoryStateStore::new());
        let a = PriceAlarmSDK::initialize(store.clone(), fast_config()).unwrap();
        let b = PriceAlarmSDK::initialize(store.clone(), fast_config()).unwrap();
        a.start();
        b.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A 端触发告警
        let t = threshold();
        let fired = evaluate(
            PriceSample {
                previous_price: 49000.0,
                current_price: 51000.0,
            },
            &t,
        );
        let alarm = a
            .lifecycle()
            .raise(&fired, &t, "BTCUSDT", Some("BTCUSDT"))
            .await
            .unwrap();

        // 等告警扩散到 B 端
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(b.alarms().alarm(&alarm.id).await.is_some(), "告警未扩散到 B 端");

        // B 端确认；A 端并发确认同一 id 会竞争失败
        assert!(b.lifecycle().approve(&alarm.id).await);
        assert!(!b.lifecycle().approve(&alarm.id).await);

        // 删除经下一轮拉取扩散回 A 端
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.alarms().alarm(&alarm.id).await.is_none(), "删除未扩散回 A 端");

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_threshold_edits_converge() {
        let store = Arc::new(MemoryStateStore::new());
        let a = PriceAlarmSDK::initialize(store.clone(), fast_config()).unwrap();
        let b = PriceAlarmSDK::initialize(store.clone(), fast_config()).unwrap();
        a.start();
        b.start();
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.thresholds()
            .add_threshold("BTCUSDT", threshold())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        let on_b = b.thresholds().pair("BTCUSDT").await;
        assert!(on_b.is_some_and(|set| set.thresholds.len() == 1));

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn test_started_sdk_sweeps_expired_alarms() {
        use crate::storage::entities::{AlarmLevelConfig, NotifyChannels};

        let store = Arc::new(MemoryStateStore::new());
        let sdk = PriceAlarmSDK::initialize(store, fast_config()).unwrap();
        sdk.start();

        // 定制 Harmless 策略：单次通知、50ms 收尾后到期
        sdk.alarm_levels()
            .set_level(AlarmLevelConfig {
                level: AlarmLevel::Harmless,
                channels: NotifyChannels::default(),
                repetitions_total: Some(1),
                sequence_ms: 0,
                tail_wait_ms: 50,
                requires_approval: false,
            })
            .await;

        let mut t = threshold();
        t.alarm_level = AlarmLevel::Harmless;
        let fired = evaluate(
            PriceSample {
                previous_price: 49000.0,
                current_price: 51000.0,
            },
            &t,
        );
        let alarm = sdk
            .lifecycle()
            .raise(&fired, &t, "BTCUSDT", None)
            .await
            .unwrap();
        assert!(alarm.auto_dismiss_at.is_some());
        assert_eq!(sdk.alarms().count().await, 1);

        // 宿主不做任何事：清扫任务自己在到期后移除告警
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sdk.alarms().count().await, 0);
        sdk.shutdown();
    }

    #[tokio::test]
    async fn test_double_start_is_noop() {
        let store = Arc::new(MemoryStateStore::new());
        let sdk = PriceAlarmSDK::initialize(store, fast_config()).unwrap();
        sdk.start();
        sdk.start();
        sdk.shutdown();
    }
}
