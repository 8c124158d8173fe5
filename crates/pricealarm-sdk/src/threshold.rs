//! 阈值引擎 - 价格穿越判定与阈值管理
//!
//! 职责：
//! - 对 (前价, 现价) 样本做纯函数穿越判定，无 I/O、无状态
//! - 阈值的创建/暂停/删除等管理操作（全部返回新值）
//! - 数字输入解析（`.` 与 `,` 小数分隔符均接受）与展示格式化
//!
//! ## NOTE: 引擎保持纯函数
//!
//! The evaluation path takes a `(previous, current)` pair and MUST stay
//! free of I/O, so it can run against a client-side price stream or a
//! server-side scheduled job without change. Price ingestion lives outside.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storage::entities::{
    AlarmLevel, PairThresholdSet, ThresholdConfig, TriggerFrequency,
};

/// 一次价格更新样本
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSample {
    pub current_price: f64,
    pub previous_price: f64,
}

/// 触发方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Increase,
    Decrease,
}

/// 单个阈值的判定结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertResult {
    pub threshold_id: String,
    pub should_trigger: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_level: Option<AlarmLevel>,
    /// 未触发时的说明（"paused" / "invalid" / "no crossing"）
    #[serde(default)]
    pub message: String,
}

impl AlertResult {
    fn skipped(threshold: &ThresholdConfig, message: &str) -> Self {
        Self {
            threshold_id: threshold.id.clone(),
            should_trigger: false,
            trigger_type: None,
            alarm_level: None,
            message: message.to_string(),
        }
    }

    fn triggered(threshold: &ThresholdConfig, trigger_type: TriggerType) -> Self {
        Self {
            threshold_id: threshold.id.clone(),
            should_trigger: true,
            trigger_type: Some(trigger_type),
            alarm_level: Some(threshold.alarm_level),
            message: String::new(),
        }
    }
}

/// 阈值是否处于启用状态：仅显式 false 视为暂停，字段缺省视为启用
pub fn is_threshold_active(threshold: &ThresholdConfig) -> bool {
    threshold.is_active != Some(false)
}

/// 向上穿越：前价在阈值之下，现价达到或越过阈值
pub fn did_cross_above(curr: f64, prev: f64, value: f64) -> bool {
    prev < value && curr >= value
}

/// 向下穿越：前价在阈值之上，现价达到或跌破阈值
pub fn did_cross_below(curr: f64, prev: f64, value: f64) -> bool {
    prev > value && curr <= value
}

/// 解析用户输入的阈值字符串
///
/// 同时接受 `.` 与 `,` 作为小数分隔符；非有限数返回 None，绝不 panic。
pub fn parse_threshold_value(raw: &str) -> Option<f64> {
    let normalized = raw.trim().replace(',', ".");
    if normalized.is_empty() {
        return None;
    }
    match normalized.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// 按本地惯例格式化阈值，最多 8 位小数，去除尾部零
pub fn format_threshold_value(value: f64, decimal_comma: bool) -> String {
    let mut s = format!("{:.8}", value);
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    if decimal_comma {
        s = s.replace('.', ",");
    }
    s
}

/// 判定一次价格更新是否触发某个阈值
///
/// 判定顺序固定：暂停 -> 数值非法 -> 向上穿越 -> 向下穿越 -> 无穿越。
/// 同一 (prev, curr) 样本至多触发一个方向。
pub fn evaluate(sample: PriceSample, threshold: &ThresholdConfig) -> AlertResult {
    if !is_threshold_active(threshold) {
        return AlertResult::skipped(threshold, "paused");
    }

    let value = match parse_threshold_value(&threshold.threshold_value) {
        Some(v) => v,
        None => return AlertResult::skipped(threshold, "invalid"),
    };

    if threshold.notify_on_increase
        && did_cross_above(sample.current_price, sample.previous_price, value)
    {
        return AlertResult::triggered(threshold, TriggerType::Increase);
    }

    if threshold.notify_on_decrease
        && did_cross_below(sample.current_price, sample.previous_price, value)
    {
        return AlertResult::triggered(threshold, TriggerType::Decrease);
    }

    AlertResult::skipped(threshold, "no crossing")
}

/// 批量判定：对一次价格更新逐一评估，每个阈值一条结果，保持输入顺序
pub fn evaluate_batch(sample: PriceSample, thresholds: &[ThresholdConfig]) -> Vec<AlertResult> {
    thresholds.iter().map(|t| evaluate(sample, t)).collect()
}

/// 只保留已触发的结果
pub fn triggered_only(results: Vec<AlertResult>) -> Vec<AlertResult> {
    results.into_iter().filter(|r| r.should_trigger).collect()
}

// ============================================================
// 管理操作 - 全部是纯函数，返回新值
// ============================================================

/// 创建带默认值的阈值（is_active 默认启用）
pub fn new_threshold(threshold_value: impl Into<String>, alarm_level: AlarmLevel) -> ThresholdConfig {
    ThresholdConfig {
        id: uuid::Uuid::new_v4().to_string(),
        threshold_value: threshold_value.into(),
        notify_on_increase: true,
        notify_on_decrease: false,
        increase_frequency: TriggerFrequency::Once,
        decrease_frequency: TriggerFrequency::Once,
        alarm_level,
        note: String::new(),
        is_active: Some(true),
    }
}

/// 切换启用/暂停
pub fn toggle_active(threshold: &ThresholdConfig) -> ThresholdConfig {
    let mut next = threshold.clone();
    next.is_active = Some(!is_threshold_active(threshold));
    next
}

/// 删除单个阈值；id 不存在是正常结果（返回 false），不是错误
pub fn delete_threshold(set: &PairThresholdSet, id: &str) -> (PairThresholdSet, bool) {
    let mut next = set.clone();
    let before = next.thresholds.len();
    next.thresholds.retain(|t| t.id != id);
    let removed = next.thresholds.len() < before;
    (next, removed)
}

/// 清空某交易对的全部阈值，保留 pair_id（空集合仍是有效状态）
pub fn delete_all_for_pair(set: &PairThresholdSet) -> PairThresholdSet {
    PairThresholdSet {
        pair_id: set.pair_id.clone(),
        thresholds: Vec::new(),
    }
}

/// 批量清空多个交易对的阈值
///
/// 被点名的交易对清为空列表，但键仍保留在映射中；未点名的原样不动。
pub fn batch_delete(
    map: &BTreeMap<String, PairThresholdSet>,
    pair_ids: &[&str],
) -> BTreeMap<String, PairThresholdSet> {
    let mut next = map.clone();
    for pair_id in pair_ids {
        if let Some(set) = next.get_mut(*pair_id) {
            set.thresholds.clear();
        }
    }
    next
}

/// 统计"已配置"的阈值数
///
/// 与裸计数不同：要求数值可解析且至少开启一个通知方向。
pub fn configured_count(thresholds: &[ThresholdConfig]) -> usize {
    thresholds
        .iter()
        .filter(|t| {
            parse_threshold_value(&t.threshold_value).is_some()
                && (t.notify_on_increase || t.notify_on_decrease)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(value: &str) -> ThresholdConfig {
        ThresholdConfig {
            id: "t1".to_string(),
            threshold_value: value.to_string(),
            notify_on_increase: true,
            notify_on_decrease: false,
            increase_frequency: TriggerFrequency::Once,
            decrease_frequency: TriggerFrequency::Once,
            alarm_level: AlarmLevel::Caution,
            note: String::new(),
            is_active: Some(true),
        }
    }

    #[test]
    fn test_cross_predicates_match_definition() {
        for &(prev, curr, v) in &[
            (49000.0, 51000.0, 50000.0),
            (50000.0, 50000.0, 50000.0),
            (51000.0, 49000.0, 50000.0),
            (49999.9, 50000.0, 50000.0),
            (-1.0, 1.0, 0.0),
        ] {
            assert_eq!(did_cross_above(curr, prev, v), prev < v && curr >= v);
            assert_eq!(did_cross_below(curr, prev, v), prev > v && curr <= v);
        }
    }

    #[test]
    fn test_increase_crossing_triggers() {
        // 50000 阈值，49000 -> 51000
        let t = threshold("50000");
        let r = evaluate(
            PriceSample {
                previous_price: 49000.0,
                current_price: 51000.0,
            },
            &t,
        );
        assert!(r.should_trigger);
        assert_eq!(r.trigger_type, Some(TriggerType::Increase));
        assert_eq!(r.alarm_level, Some(AlarmLevel::Caution));
    }

    #[test]
    fn test_paused_threshold_never_triggers() {
        let mut t = threshold("50000");
        t.is_active = Some(false);
        t.notify_on_decrease = true;
        for &(prev, curr) in &[
            (49000.0, 51000.0),
            (51000.0, 49000.0),
            (0.0, 1e12),
            (f64::MIN, f64::MAX),
        ] {
            let r = evaluate(
                PriceSample {
                    previous_price: prev,
                    current_price: curr,
                },
                &t,
            );
            assert!(!r.should_trigger);
            assert!(r.message.contains("paused"));
        }
    }

    #[test]
    fn test_absent_is_active_means_active() {
        let mut t = threshold("50000");
        t.is_active = None;
        assert!(is_threshold_active(&t));
        let r = evaluate(
            PriceSample {
                previous_price: 49000.0,
                current_price: 51000.0,
            },
            &t,
        );
        assert!(r.should_trigger);
    }

    #[test]
    fn test_invalid_value_never_throws() {
        for bad in ["", "abc", "1.2.3", "NaN", "inf", "∞"] {
            let t = threshold(bad);
            let r = evaluate(
                PriceSample {
                    previous_price: 1.0,
                    current_price: 2.0,
                },
                &t,
            );
            assert!(!r.should_trigger, "value {:?} 不应触发", bad);
            assert!(r.message.contains("invalid"));
        }
    }

    #[test]
    fn test_only_one_direction_per_sample() {
        // 两个方向都开，一次样本只能触发一个方向
        let mut t = threshold("50000");
        t.notify_on_decrease = true;
        let up = evaluate(
            PriceSample {
                previous_price: 49000.0,
                current_price: 51000.0,
            },
            &t,
        );
        assert_eq!(up.trigger_type, Some(TriggerType::Increase));
        let down = evaluate(
            PriceSample {
                previous_price: 51000.0,
                current_price: 49000.0,
            },
            &t,
        );
        assert_eq!(down.trigger_type, Some(TriggerType::Decrease));
    }

    #[test]
    fn test_no_crossing_message() {
        let t = threshold("50000");
        let r = evaluate(
            PriceSample {
                previous_price: 48000.0,
                current_price: 49000.0,
            },
            &t,
        );
        assert!(!r.should_trigger);
        assert!(r.message.contains("no crossing"));
    }

    #[test]
    fn test_batch_and_filter() {
        let mut paused = threshold("50000");
        paused.id = "t2".to_string();
        paused.is_active = Some(false);
        let sample = PriceSample {
            previous_price: 49000.0,
            current_price: 51000.0,
        };
        let results = evaluate_batch(sample, &[threshold("50000"), paused]);
        assert_eq!(results.len(), 2);
        let fired = triggered_only(results);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold_id, "t1");
    }

    #[test]
    fn test_parse_accepts_comma_and_dot() {
        assert_eq!(parse_threshold_value("50000.5"), Some(50000.5));
        assert_eq!(parse_threshold_value("50000,5"), Some(50000.5));
        assert_eq!(parse_threshold_value(" 0,00000001 "), Some(0.00000001));
        assert_eq!(parse_threshold_value(""), None);
        assert_eq!(parse_threshold_value("1,2,3"), None);
    }

    #[test]
    fn test_format_up_to_eight_fraction_digits() {
        assert_eq!(format_threshold_value(50000.0, false), "50000");
        assert_eq!(format_threshold_value(0.00000001, false), "0.00000001");
        assert_eq!(format_threshold_value(1.5, true), "1,5");
        assert_eq!(format_threshold_value(1.123456789, false), "1.12345679");
    }

    #[test]
    fn test_toggle_active() {
        let t = threshold("1");
        let paused = toggle_active(&t);
        assert_eq!(paused.is_active, Some(false));
        let resumed = toggle_active(&paused);
        assert_eq!(resumed.is_active, Some(true));
        // 缺省（启用）切换后变为暂停
        let mut absent = threshold("1");
        absent.is_active = None;
        assert_eq!(toggle_active(&absent).is_active, Some(false));
    }

    #[test]
    fn test_new_threshold_defaults() {
        let t = new_threshold("100", AlarmLevel::Harmless);
        assert_eq!(t.is_active, Some(true));
        assert!(t.notify_on_increase);
        assert!(!t.id.is_empty());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_delete_all_for_pair_keeps_pair_id() {
        // 5 个阈值全删，pair_id 不变，长度为 0
        let set = PairThresholdSet {
            pair_id: "BTCUSDT".to_string(),
            thresholds: (0..5)
                .map(|i| {
                    let mut t = threshold("1");
                    t.id = format!("t{}", i);
                    t
                })
                .collect(),
        };
        let emptied = delete_all_for_pair(&set);
        assert_eq!(emptied.thresholds.len(), 0);
        assert_eq!(emptied.pair_id, "BTCUSDT");
    }

    #[test]
    fn test_delete_threshold_idempotent_result() {
        let set = PairThresholdSet {
            pair_id: "p".to_string(),
            thresholds: vec![threshold("1")],
        };
        let (after, removed) = delete_threshold(&set, "t1");
        assert!(removed);
        assert!(after.thresholds.is_empty());
        let (after2, removed2) = delete_threshold(&after, "t1");
        assert!(!removed2);
        assert!(after2.thresholds.is_empty());
    }

    #[test]
    fn test_batch_delete_preserves_keys() {
        // A:3, B:2, C:4，批删 [A, C]
        let mk = |pair: &str, n: usize| PairThresholdSet {
            pair_id: pair.to_string(),
            thresholds: (0..n)
                .map(|i| {
                    let mut t = threshold("1");
                    t.id = format!("{}-{}", pair, i);
                    t
                })
                .collect(),
        };
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), mk("A", 3));
        map.insert("B".to_string(), mk("B", 2));
        map.insert("C".to_string(), mk("C", 4));

        let next = batch_delete(&map, &["A", "C"]);
        assert_eq!(next.len(), 3);
        assert_eq!(next["A"].thresholds.len(), 0);
        assert_eq!(next["B"].thresholds.len(), 2);
        assert_eq!(next["C"].thresholds.len(), 0);
        // 不存在的交易对被忽略
        let same = batch_delete(&next, &["Z"]);
        assert_eq!(same, next);
    }

    #[test]
    fn test_configured_count() {
        let mut no_direction = threshold("1");
        no_direction.id = "nd".to_string();
        no_direction.notify_on_increase = false;
        let mut bad_value = threshold("x");
        bad_value.id = "bv".to_string();
        let list = vec![threshold("1"), no_direction, bad_value];
        assert_eq!(list.len(), 3);
        assert_eq!(configured_count(&list), 1);
    }
}
