//! 数据实体定义 - 四个同步集合的线上结构
//!
//! 这里定义了所有被同步集合对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持（字段名与后端线上格式一致，camelCase）
//!
//! 每个集合整体携带一个 `timestamp`（毫秒逻辑时钟），由 StateStore
//! 在 PUT 时分配；后续同步按该时间戳做 last-writer-wins 整体替换。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PriceAlarmSDKError, Result};

/// 告警级别 - 严重程度按声明顺序递增
///
/// 排序用于多告警同时触发时的展示/升级优先级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    Harmless,
    Caution,
    Dangerous,
    VeryDangerous,
}

impl AlarmLevel {
    /// 严重程度数值（越大越严重）
    pub fn severity(&self) -> u8 {
        match self {
            AlarmLevel::Harmless => 0,
            AlarmLevel::Caution => 1,
            AlarmLevel::Dangerous => 2,
            AlarmLevel::VeryDangerous => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmLevel::Harmless => "harmless",
            AlarmLevel::Caution => "caution",
            AlarmLevel::Dangerous => "dangerous",
            AlarmLevel::VeryDangerous => "very_dangerous",
        }
    }

    /// 全部级别（配置初始化用）
    pub fn all() -> [AlarmLevel; 4] {
        [
            AlarmLevel::Harmless,
            AlarmLevel::Caution,
            AlarmLevel::Dangerous,
            AlarmLevel::VeryDangerous,
        ]
    }
}

/// 触发频率 - 单次或重复
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerFrequency {
    Once,
    Repeating,
}

/// 交易对元信息（市场类型 + 展示符号）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairMeta {
    pub market_type: String,
    pub symbol: String,
}

/// 自选列表快照 - 所有客户端共同持有，任一客户端可整体替换
///
/// `items` 为集合语义（成员顺序无意义），相等性比较与内容哈希
/// 均不区分顺序，见 `sync::merge`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchlistSnapshot {
    pub items: BTreeSet<String>,
    #[serde(default)]
    pub pair_meta: BTreeMap<String, PairMeta>,
    #[serde(default)]
    pub timestamp: i64,
}

/// 阈值配置 - 单个价格阈值及其通知方向/频率
///
/// `is_active` 缺省（None）视为启用；仅显式 false 表示暂停。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub id: String,
    /// 阈值，十进制字符串（保留用户输入精度，解析见 threshold 模块）
    pub threshold_value: String,
    pub notify_on_increase: bool,
    pub notify_on_decrease: bool,
    pub increase_frequency: TriggerFrequency,
    pub decrease_frequency: TriggerFrequency,
    pub alarm_level: AlarmLevel,
    #[serde(default)]
    pub note: String,
    /// None 等价于 Some(true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl ThresholdConfig {
    /// 边界校验：拒绝畸形负载，不做静默纠正
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PriceAlarmSDKError::InvalidData(
                "threshold id 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

/// 单个交易对的阈值集合
///
/// 即使所有阈值被删空，该结构仍以空列表形式保留在集合中——
/// "空"本身是有意义的状态，不等于"不存在"。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairThresholdSet {
    pub pair_id: String,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
}

impl PairThresholdSet {
    pub fn empty(pair_id: impl Into<String>) -> Self {
        Self {
            pair_id: pair_id.into(),
            thresholds: Vec::new(),
        }
    }

    /// 校验：pair_id 非空，阈值 id 在本集合内唯一
    pub fn validate(&self) -> Result<()> {
        if self.pair_id.trim().is_empty() {
            return Err(PriceAlarmSDKError::InvalidData(
                "pair_id 不能为空".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for t in &self.thresholds {
            t.validate()?;
            if !seen.insert(t.id.as_str()) {
                return Err(PriceAlarmSDKError::InvalidData(format!(
                    "重复的 threshold id: {}",
                    t.id
                )));
            }
        }
        Ok(())
    }
}

/// 阈值集合 - pair_id -> PairThresholdSet，整体作为一个同步集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdCollection {
    #[serde(default)]
    pub pairs: BTreeMap<String, PairThresholdSet>,
    #[serde(default)]
    pub timestamp: i64,
}

/// 通知渠道开关
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyChannels {
    pub push: bool,
    pub email: bool,
    pub sms: bool,
    pub web_push: bool,
    pub native_push: bool,
}

/// 按告警级别的投递策略（渠道 + 重复节奏），全局共享
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmLevelConfig {
    pub level: AlarmLevel,
    pub channels: NotifyChannels,
    /// None 表示不限次数重复
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions_total: Option<u32>,
    /// 两次通知之间的间隔（毫秒）
    pub sequence_ms: i64,
    /// 最后一次通知之后到自动消除的等待（毫秒）
    pub tail_wait_ms: i64,
    /// true 时告警只能被显式确认，永不自动消除
    pub requires_approval: bool,
}

impl AlarmLevelConfig {
    /// 各级别的出厂默认策略
    pub fn default_for(level: AlarmLevel) -> Self {
        match level {
            AlarmLevel::Harmless => Self {
                level,
                channels: NotifyChannels {
                    push: true,
                    ..Default::default()
                },
                repetitions_total: Some(1),
                sequence_ms: 60_000,
                tail_wait_ms: 60_000,
                requires_approval: false,
            },
            AlarmLevel::Caution => Self {
                level,
                channels: NotifyChannels {
                    push: true,
                    web_push: true,
                    ..Default::default()
                },
                repetitions_total: Some(3),
                sequence_ms: 60_000,
                tail_wait_ms: 120_000,
                requires_approval: false,
            },
            AlarmLevel::Dangerous => Self {
                level,
                channels: NotifyChannels {
                    push: true,
                    web_push: true,
                    native_push: true,
                    email: true,
                    sms: false,
                },
                repetitions_total: Some(5),
                sequence_ms: 30_000,
                tail_wait_ms: 300_000,
                requires_approval: false,
            },
            AlarmLevel::VeryDangerous => Self {
                level,
                channels: NotifyChannels {
                    push: true,
                    web_push: true,
                    native_push: true,
                    email: true,
                    sms: true,
                },
                repetitions_total: None,
                sequence_ms: 15_000,
                tail_wait_ms: 0,
                requires_approval: true,
            },
        }
    }
}

/// 告警级别配置集合 - level -> AlarmLevelConfig
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmLevelCollection {
    #[serde(default)]
    pub levels: BTreeMap<AlarmLevel, AlarmLevelConfig>,
    #[serde(default)]
    pub timestamp: i64,
}

impl AlarmLevelCollection {
    /// 出厂默认：四个级别各一条默认策略
    pub fn with_defaults() -> Self {
        let mut levels = BTreeMap::new();
        for level in AlarmLevel::all() {
            levels.insert(level, AlarmLevelConfig::default_for(level));
        }
        Self {
            levels,
            timestamp: 0,
        }
    }
}

/// 正在触发的告警
///
/// 由 AlarmLifecycleManager 创建；通过确认删除或自动消除进入终态；
/// 重复通知的簿记字段原地更新。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlarm {
    pub id: String,
    pub instrument_name: String,
    pub threshold_value: String,
    pub alarm_level: AlarmLevel,
    /// 触发时刻（毫秒时间戳）
    pub triggered_at: i64,
    pub message: String,
    #[serde(default)]
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
    /// true 时只能被用户显式确认，不会自动消除
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetitions_total: Option<u32>,
    /// 自动消除时刻；requires_approval 为 true 时恒为 None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_dismiss_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_ms: Option<i64>,
    /// 投递渠道，由外部分发器消费；SDK 只定义形状
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<NotifyChannels>,
}

impl ActiveAlarm {
    /// 边界校验：拒绝畸形负载
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PriceAlarmSDKError::InvalidData(
                "alarm id 不能为空".to_string(),
            ));
        }
        if self.instrument_name.trim().is_empty() {
            return Err(PriceAlarmSDKError::InvalidData(
                "instrument_name 不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

/// 告警集合 - alarm id -> ActiveAlarm
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCollection {
    #[serde(default)]
    pub alarms: BTreeMap<String, ActiveAlarm>,
    #[serde(default)]
    pub timestamp: i64,
}
