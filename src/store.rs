use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::stream::{StreamRecord, StreamStatus};

/// 流状态存储
///
/// 内存侧是保持插入顺序的注册表，磁盘侧是单个 JSON 文档。
/// 进程启动时构造一次，由生命周期管理器独占持有，不做全局单例。
///
/// # 持久化
/// - 每次需要跨重启存活的变更后调用 persist()
/// - 先写临时文件再原子改名，中途崩溃不会损坏旧状态
/// - 加载失败只降级为空注册表并记录错误，不中断启动
pub struct StreamStore {
    path: PathBuf,
    records: Mutex<Vec<StreamRecord>>,
}

impl StreamStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(Vec::new()),
        }
    }

    /// 插入或按 id 原位替换，保持插入顺序
    pub fn upsert(&self, record: StreamRecord) {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
    }

    pub fn remove(&self, id: &str) -> Option<StreamRecord> {
        let mut records = self.records.lock().unwrap();
        let idx = records.iter().position(|r| r.id == id)?;
        Some(records.remove(idx))
    }

    pub fn get(&self, id: &str) -> Option<StreamRecord> {
        self.records.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<StreamRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }

    pub fn list_all(&self) -> Vec<StreamRecord> {
        self.records.lock().unwrap().clone()
    }

    /// 对指定记录应用一次修改，返回修改后的副本
    pub fn update<F>(&self, id: &str, f: F) -> Option<StreamRecord>
    where
        F: FnOnce(&mut StreamRecord),
    {
        let mut records = self.records.lock().unwrap();
        let record = records.iter_mut().find(|r| r.id == id)?;
        f(record);
        Some(record.clone())
    }

    /// 将全部记录写入状态文件
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.records.lock().unwrap().clone();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Persistence(format!("create {:?}: {}", parent, e)))?;
        }

        // 写临时文件后原子改名，避免写到一半时留下损坏的状态
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| Error::Persistence(format!("write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("rename {:?}: {}", tmp, e)))?;

        Ok(())
    }

    /// 启动时加载状态文件，返回加载到的记录数
    ///
    /// 所有记录统一归位为 stopped，进程身份不跨重启存活，
    /// 是否重新拉起由生命周期管理器按流类型决定。
    pub async fn load(&self) -> usize {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?}, starting empty", self.path);
                return 0;
            }
            Err(e) => {
                error!("Failed to read state file {:?}: {}", self.path, e);
                return 0;
            }
        };

        let mut loaded: Vec<StreamRecord> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                error!("State file {:?} is corrupt, starting empty: {}", self.path, e);
                return 0;
            }
        };

        for record in &mut loaded {
            record.status = StreamStatus::Stopped;
            record.restart_count = 0;
        }

        let count = loaded.len();
        *self.records.lock().unwrap() = loaded;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{generate_id, StreamKind};
    use chrono::Utc;
    use tempfile::TempDir;

    fn sample_record(name: &str, status: StreamStatus) -> StreamRecord {
        let id = generate_id();
        StreamRecord {
            output_dir: PathBuf::from("/tmp/hls").join(&id),
            id,
            name: name.to_string(),
            source_url: "rtsp://cam.local/main".to_string(),
            resolved_url: "rtsp://cam.local/main".to_string(),
            kind: StreamKind::Direct,
            status,
            created_at: Utc::now(),
            last_token_refresh_at: None,
            restart_count: 3,
        }
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");

        let store = StreamStore::new(&path);
        let a = sample_record("cam-a", StreamStatus::Running);
        let b = sample_record("cam-b", StreamStatus::Failed);
        store.upsert(a.clone());
        store.upsert(b.clone());
        store.persist().await.unwrap();

        let reloaded = StreamStore::new(&path);
        assert_eq!(reloaded.load().await, 2);

        let got = reloaded.list_all();
        // 插入顺序保持不变
        assert_eq!(got[0].id, a.id);
        assert_eq!(got[1].id, b.id);
        assert_eq!(got[0].name, a.name);
        assert_eq!(got[0].source_url, a.source_url);
        assert_eq!(got[0].resolved_url, a.resolved_url);
        assert_eq!(got[0].kind, a.kind);
        assert_eq!(got[0].created_at, a.created_at);
        // 状态与重启计数在加载时归位
        assert_eq!(got[0].status, StreamStatus::Stopped);
        assert_eq!(got[1].status, StreamStatus::Stopped);
        assert_eq!(got[0].restart_count, 0);
    }

    #[tokio::test]
    async fn removal_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");

        let store = StreamStore::new(&path);
        let a = sample_record("cam-a", StreamStatus::Running);
        let b = sample_record("cam-b", StreamStatus::Running);
        store.upsert(a.clone());
        store.upsert(b.clone());
        store.persist().await.unwrap();

        assert!(store.remove(&a.id).is_some());
        store.persist().await.unwrap();

        let reloaded = StreamStore::new(&path);
        assert_eq!(reloaded.load().await, 1);
        assert!(reloaded.get(&a.id).is_none());
        assert!(reloaded.get(&b.id).is_some());
    }

    #[tokio::test]
    async fn corrupt_state_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("streams.json");
        tokio::fs::write(&path, b"{ this is not json").await.unwrap();

        let store = StreamStore::new(&path);
        assert_eq!(store.load().await, 0);
        assert!(store.list_all().is_empty());
    }

    #[tokio::test]
    async fn missing_state_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = StreamStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().await, 0);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let store = StreamStore::new("/tmp/unused.json");
        let mut a = sample_record("cam-a", StreamStatus::Running);
        store.upsert(a.clone());
        store.upsert(sample_record("cam-b", StreamStatus::Running));

        a.name = "renamed".to_string();
        store.upsert(a.clone());

        let got = store.list_all();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, a.id);
        assert_eq!(got[0].name, "renamed");
    }
}
