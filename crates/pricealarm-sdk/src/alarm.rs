//! 告警生命周期管理 - 创建 / 重复通知簿记 / 确认删除 / 自动消除
//!
//! 状态机（每条 ActiveAlarm）：
//! created（阈值触发）→ repeating（0..total-1 次追加通知，total 缺省则
//! 不限次）→ 终态。终态只有两条路径：确认删除，或自动消除超时，
//! 先到者生效；但 requires_approval 为 true 时自动消除永不发生，
//! 确认是唯一的终态路径。
//!
//! 确认 = 对共享告警集合的幂等按 id 删除：任一端第一个删除成功，
//! 其余端（包括并发竞争同一 id 的）得到"不存在"。删除经同步引擎
//! 的下一轮拉取扩散到所有端——这就是"一端确认、处处消失"的机制。

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PriceAlarmSDKError, Result};
use crate::storage::entities::{ActiveAlarm, ThresholdConfig};
use crate::storage::{AlarmLevelStore, AlarmStore};
use crate::threshold::{AlertResult, TriggerType};
use crate::utils::now_ms;

/// 告警生命周期管理器
#[derive(Clone)]
pub struct AlarmLifecycleManager {
    alarms: Arc<AlarmStore>,
    levels: Arc<AlarmLevelStore>,
}

impl AlarmLifecycleManager {
    pub fn new(alarms: Arc<AlarmStore>, levels: Arc<AlarmLevelStore>) -> Self {
        Self { alarms, levels }
    }

    /// 由触发结果创建告警
    ///
    /// 渠道与重复节奏取自该级别的投递策略；自动消除时刻
    /// `auto_dismiss_at = now + max(0, total-1) * sequence_ms + tail_wait_ms`
    /// 仅在 requires_approval 为 false 时于创建时一次性计算。
    pub async fn raise(
        &self,
        result: &AlertResult,
        threshold: &ThresholdConfig,
        instrument_name: &str,
        pair_id: Option<&str>,
    ) -> Result<ActiveAlarm> {
        if !result.should_trigger {
            return Err(PriceAlarmSDKError::InvalidOperation(
                "未触发的判定结果不能生成告警".to_string(),
            ));
        }

        let level = result.alarm_level.unwrap_or(threshold.alarm_level);
        let policy = self.levels.level(level).await;
        let now = now_ms();

        let auto_dismiss_at = if policy.requires_approval {
            None
        } else {
            let repeats = policy.repetitions_total.map(|t| t.saturating_sub(1)).unwrap_or(0);
            Some(now + repeats as i64 * policy.sequence_ms + policy.tail_wait_ms)
        };

        let direction = match result.trigger_type {
            Some(TriggerType::Increase) => "rose above",
            Some(TriggerType::Decrease) => "fell below",
            None => "crossed",
        };

        let alarm = ActiveAlarm {
            id: uuid::Uuid::new_v4().to_string(),
            instrument_name: instrument_name.to_string(),
            threshold_value: threshold.threshold_value.clone(),
            alarm_level: level,
            triggered_at: now,
            message: format!("{} {} {}", instrument_name, direction, threshold.threshold_value),
            note: threshold.note.clone(),
            threshold_id: Some(threshold.id.clone()),
            pair_id: pair_id.map(String::from),
            requires_approval: policy.requires_approval,
            repetitions_completed: Some(0),
            repetitions_total: policy.repetitions_total,
            auto_dismiss_at,
            last_notified_at: Some(now),
            sequence_ms: Some(policy.sequence_ms),
            channels: Some(policy.channels),
        };
        alarm.validate()?;

        info!(
            "告警创建: id={}, level={}, requires_approval={}",
            alarm.id,
            level.as_str(),
            alarm.requires_approval
        );
        self.alarms.insert(alarm.clone()).await?;
        Ok(alarm)
    }

    /// 确认告警：幂等按 id 删除
    ///
    /// 首个调用方 true；其后（含其他端并发竞争）一律 false。
    /// false 是正常结果，调用方按 no-op 处理，不向用户报错。
    pub async fn approve(&self, id: &str) -> bool {
        let removed = self.alarms.remove(id).await;
        if removed {
            info!("告警已确认删除: id={}", id);
        } else {
            debug!("确认目标不存在（已被他端删除）: id={}", id);
        }
        removed
    }

    /// 记录一次追加通知
    ///
    /// 返回 None 表示告警不存在；Some(true) 表示之后还有剩余通知
    /// （total 缺省即不限次，恒有剩余）。
    pub async fn record_repetition(&self, id: &str) -> Option<bool> {
        let mutated = self
            .alarms
            .mutate(id, |alarm| {
                alarm.repetitions_completed =
                    Some(alarm.repetitions_completed.unwrap_or(0) + 1);
                alarm.last_notified_at = Some(now_ms());
            })
            .await;
        if !mutated {
            return None;
        }
        let alarm = self.alarms.alarm(id).await?;
        let has_more = match alarm.repetitions_total {
            Some(total) => alarm.repetitions_completed.unwrap_or(0) < total,
            None => true,
        };
        Some(has_more)
    }

    /// 清扫到期的自动消除告警，返回被移除的 id
    ///
    /// requires_approval 为 true 的告警无论重复了多少次都不在清扫范围。
    pub async fn sweep_auto_dismiss(&self, now: i64) -> Vec<String> {
        let due: Vec<String> = self
            .alarms
            .get()
            .await
            .alarms
            .values()
            .filter(|a| !a.requires_approval && a.auto_dismiss_at.is_some_and(|t| t <= now))
            .map(|a| a.id.clone())
            .collect();

        let mut removed = Vec::new();
        for id in due {
            if self.alarms.remove(&id).await {
                debug!("告警自动消除: id={}", id);
                removed.push(id);
            }
        }
        removed
    }

    /// 展示/升级用优先级排序：严重程度降序，同级按触发时刻新者在前
    pub async fn ordered(&self) -> Vec<ActiveAlarm> {
        let mut alarms: Vec<ActiveAlarm> =
            self.alarms.get().await.alarms.into_values().collect();
        alarms.sort_by(|a, b| {
            b.alarm_level
                .severity()
                .cmp(&a.alarm_level.severity())
                .then(b.triggered_at.cmp(&a.triggered_at))
        });
        alarms
    }
}
