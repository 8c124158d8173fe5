//! 本地持久缓存 - 基于 sled 的告警镜像
//!
//! 尽力而为地保存最近一次已知的告警集合，客户端启动后、
//! 首次拉取完成前即可渲染。非权威数据：以 StateStore 为准，
//! 写入失败只记日志，绝不影响主流程。

use std::path::Path;

use crate::error::Result;
use crate::storage::entities::AlarmCollection;

const ALARMS_KEY: &[u8] = b"active_alarms";
const TREE_NAME: &str = "alarm_mirror";

/// 告警镜像缓存
#[derive(Debug)]
pub struct AlarmCache {
    #[allow(dead_code)]
    db: sled::Db,
    tree: sled::Tree,
}

impl AlarmCache {
    /// 打开缓存目录
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    /// 保存最近一次已知的告警集合
    pub fn save(&self, alarms: &AlarmCollection) -> Result<()> {
        let bytes = serde_json::to_vec(alarms)?;
        self.tree.insert(ALARMS_KEY, bytes)?;
        Ok(())
    }

    /// 读取上次保存的告警集合；从未保存或数据损坏时返回 None
    pub fn load(&self) -> Option<AlarmCollection> {
        match self.tree.get(ALARMS_KEY) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("读取告警缓存失败: {}", e);
                None
            }
        }
    }

    /// 清空镜像
    pub fn clear(&self) -> Result<()> {
        self.tree.remove(ALARMS_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{ActiveAlarm, AlarmLevel};
    use tempfile::TempDir;

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

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = AlarmCache::open(dir.path()).unwrap();
        assert!(cache.load().is_none());

        let mut collection = AlarmCollection::default();
        collection.alarms.insert("a1".to_string(), alarm("a1"));
        collection.timestamp = 7;
        cache.save(&collection).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded, collection);

        cache.clear().unwrap();
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_corrupt_payload_yields_none() {
        let dir = TempDir::new().unwrap();
        let cache = AlarmCache::open(dir.path()).unwrap();
        cache.tree.insert(ALARMS_KEY, &b"not json"[..]).unwrap();
        assert!(cache.load().is_none());
    }
}
