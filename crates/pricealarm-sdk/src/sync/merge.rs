//! 合并解析器 - 仅在首次同步时使用的双向合并
//!
//! 职责：
//! - 自选列表：成员并集，成员元信息按快照时间戳取新
//! - 单值配置块（阈值集合、级别配置、告警集合）：整体取时间戳较大的一侧
//! - 规范化 / 语义相等 / 内容哈希，三者基于同一规范形
//!
//! 规范形剥离逻辑时钟字段并固定集合成员顺序，因此
//! "内容相同但时间戳不同"的快照哈希一致，不会触发回声推送。

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{PriceAlarmSDKError, Result};
use crate::storage::entities::WatchlistSnapshot;
use crate::sync::CollectionKind;

/// 集合内容的规范形：剥离顶层 timestamp，自选列表成员排序去重
pub fn canonicalize(kind: CollectionKind, payload: &Value) -> Value {
    let mut value = payload.clone();
    if let Value::Object(map) = &mut value {
        map.remove("timestamp");
        if kind == CollectionKind::Watchlist {
            if let Some(Value::Array(items)) = map.get_mut("items") {
                items.sort_by(|a, b| {
                    a.as_str().unwrap_or_default().cmp(b.as_str().unwrap_or_default())
                });
                items.dedup();
            }
        }
    }
    value
}

/// 语义相等：对集合类内容与成员顺序无关
pub fn semantic_eq(kind: CollectionKind, a: &Value, b: &Value) -> bool {
    canonicalize(kind, a) == canonicalize(kind, b)
}

/// 规范形的 SHA-256 内容哈希（hex）
///
/// serde_json 的对象键有序，同一规范形必得同一串行化结果。
pub fn content_hash(kind: CollectionKind, payload: &Value) -> String {
    let canonical = canonicalize(kind, payload).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// 读取负载内嵌的逻辑时钟，缺失视为 0
fn embedded_timestamp(payload: &Value) -> i64 {
    payload
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// 首次同步的双向合并入口
///
/// 仅 initial_sync 调用；之后的每个 tick 都是单向整体替换。
pub fn merge_initial(kind: CollectionKind, local: &Value, remote: &Value) -> Result<Value> {
    match kind {
        CollectionKind::Watchlist => merge_watchlist_values(local, remote),
        // 单值配置块：整体取时间戳较大的一侧，不做字段级合并；
        // 相等时取远端（与后续 LWW 替换方向一致）
        CollectionKind::Thresholds
        | CollectionKind::AlarmLevels
        | CollectionKind::ActiveAlarms => {
            if embedded_timestamp(remote) >= embedded_timestamp(local) {
                Ok(remote.clone())
            } else {
                Ok(local.clone())
            }
        }
    }
}

/// 自选列表合并：成员并集；两侧都有的成员，元信息按快照时间戳取新
pub fn merge_watchlist(local: &WatchlistSnapshot, remote: &WatchlistSnapshot) -> WatchlistSnapshot {
    let mut merged = WatchlistSnapshot::default();
    merged.items = local.items.union(&remote.items).cloned().collect();
    merged.timestamp = local.timestamp.max(remote.timestamp);

    let remote_newer = remote.timestamp > local.timestamp;
    for item in &merged.items {
        let meta = match (local.pair_meta.get(item), remote.pair_meta.get(item)) {
            (Some(l), Some(r)) => Some(if remote_newer { r } else { l }),
            (Some(l), None) => Some(l),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        };
        if let Some(meta) = meta {
            merged.pair_meta.insert(item.clone(), meta.clone());
        }
    }
    merged
}

fn merge_watchlist_values(local: &Value, remote: &Value) -> Result<Value> {
    let local: WatchlistSnapshot = serde_json::from_value(local.clone())
        .map_err(|e| PriceAlarmSDKError::InvalidData(format!("本地自选列表解析失败: {}", e)))?;
    let remote: WatchlistSnapshot = serde_json::from_value(remote.clone())
        .map_err(|e| PriceAlarmSDKError::InvalidData(format!("远端自选列表解析失败: {}", e)))?;
    let merged = merge_watchlist(&local, &remote);
    Ok(serde_json::to_value(merged)?)
}

/// 将对象负载的顶层 timestamp 改写为给定值（推送后对齐 StateStore 分配值用）
pub fn with_timestamp(payload: &Value, timestamp: i64) -> Value {
    let mut value = payload.clone();
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".to_string(), Value::from(timestamp));
    } else if value.is_null() {
        let mut map = Map::new();
        map.insert("timestamp".to_string(), Value::from(timestamp));
        value = Value::Object(map);
    }
    value
}
