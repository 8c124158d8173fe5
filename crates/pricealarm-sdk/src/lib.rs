//! PriceAlarm SDK - 多端价格告警状态同步 SDK
//!
//! 本 SDK 提供价格告警客户端的共享状态层，包括：
//! - 📋 四类集合：自选列表、按交易对的阈值配置、级别投递策略、活动告警
//! - 🔄 最终一致同步：轮询拉取 + 防抖推送，首轮双向合并，其后单向 LWW 替换
//! - 🔇 回声抑制：内容哈希 + 远端应用静默期，杜绝推拉反馈环
//! - 📈 纯函数阈值判定：价格穿越检测与本地化数值解析
//! - 🚨 告警生命周期：幂等确认删除、自动消除时刻、重复通知计数
//! - 💾 sled 本地镜像：启动即可渲染上次已知的告警集合
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pricealarm_sdk::{MemoryStateStore, PriceAlarmConfig, PriceAlarmSDK};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = PriceAlarmConfig::builder()
//!         .cache_dir("/path/to/cache")
//!         .build();
//!
//!     // 注入状态后端并初始化
//!     let store = Arc::new(MemoryStateStore::new());
//!     let sdk = PriceAlarmSDK::initialize(store, config)?;
//!
//!     // 启动四个集合的同步引擎
//!     sdk.start();
//!
//!     // 本地修改自动防抖推送
//!     sdk.watchlist().add_pair("BTCUSDT", None).await;
//!
//!     // 关闭 SDK
//!     sdk.shutdown();
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod alarm;
pub mod error;
pub mod events;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod threshold;
pub mod utils;

// 重新导出常用类型
pub use alarm::AlarmLifecycleManager;
pub use error::{PriceAlarmSDKError, Result};
pub use events::{SyncEvent, SyncEventBus};
pub use sdk::{PriceAlarmConfig, PriceAlarmConfigBuilder, PriceAlarmSDK};
pub use storage::entities::{
    ActiveAlarm, AlarmCollection, AlarmLevel, AlarmLevelCollection, AlarmLevelConfig,
    NotifyChannels, PairMeta, PairThresholdSet, ThresholdCollection, ThresholdConfig,
    TriggerFrequency, WatchlistSnapshot,
};
pub use storage::{AlarmLevelStore, AlarmStore, ThresholdStore, WatchlistStore};
pub use sync::{
    CollectionKind, MemoryStateStore, RemoteSnapshot, StateStore, SyncEngine, SyncEngineConfig,
    SyncTarget,
};
pub use threshold::{AlertResult, PriceSample, TriggerType};
