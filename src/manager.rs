use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::{ExitEvent, TranscoderEngine};
use crate::error::{Error, Result};
use crate::resolver::UrlResolver;
use crate::store::StreamStore;
use crate::stream::{classify_url, generate_id, StreamKind, StreamRecord, StreamStatus};

/// 故障恢复状态
struct RecoveryState {
    /// 当前窗口内的连续崩溃次数
    crash_count: u32,
    /// 下次允许尝试重启的最早时间点
    next_retry_at: Option<Instant>,
    /// 本轮故障窗口的起点
    window_started_at: Instant,
    /// 最近一次拉起进程的时间，持续运行超过窗口视为恢复
    last_started_at: Instant,
}

impl RecoveryState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            crash_count: 0,
            next_retry_at: None,
            window_started_at: now,
            last_started_at: now,
        }
    }
}

/// 流生命周期管理器
///
/// 对外提供 add / remove / restart / list 四个操作，内部协调
/// 状态存储、外部解析器与转码进程管理，并消费进程退出通知。
///
/// # 并发约定
/// - 不同 id 的操作互不阻塞，同 id 的操作经各自的互斥锁串行化
/// - list 只读注册表，从不等待任何进行中的启停
/// - 移除流时取消该流所有挂起的解析调用与重试定时
pub struct StreamManager {
    config: AppConfig,
    store: StreamStore,
    engine: Arc<dyn TranscoderEngine>,
    resolver: Arc<dyn UrlResolver>,
    recovery: Mutex<HashMap<String, RecoveryState>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl StreamManager {
    pub fn new(
        config: AppConfig,
        store: StreamStore,
        engine: Arc<dyn TranscoderEngine>,
        resolver: Arc<dyn UrlResolver>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            resolver,
            recovery: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cancel_token(&self, id: &str) -> CancellationToken {
        let mut cancels = self.cancels.lock().unwrap();
        cancels
            .entry(id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn mark_started(&self, id: &str) {
        let mut recovery = self.recovery.lock().unwrap();
        let rec = recovery.entry(id.to_string()).or_insert_with(RecoveryState::new);
        rec.last_started_at = Instant::now();
    }

    /// 持久化失败只报告，不回滚内存变更
    async fn persist_reporting(&self) {
        if let Err(e) = self.store.persist().await {
            warn!("{}", e);
        }
    }

    /// 拉起进程并返回由此得到的流状态
    async fn launch(&self, record: &StreamRecord) -> StreamStatus {
        match self
            .engine
            .start(&record.id, &record.resolved_url, &record.output_dir)
            .await
        {
            Ok(()) => {
                self.mark_started(&record.id);
                StreamStatus::Running
            }
            Err(e) => {
                error!("Failed to launch transcoder for [{}]: {}", record.id, e);
                StreamStatus::Failed
            }
        }
    }

    // ------------------------------------------------------------------
    // 对外操作
    // ------------------------------------------------------------------

    /// 登记并启动一条新流
    ///
    /// # 任务流程：
    /// - 归类 URL，平台流先同步解析出直连地址
    /// - 先落盘再启动，启动失败记录为 failed 但保留记录
    ///
    /// # 错误处理
    /// - URL 不合法返回 InvalidUrl
    /// - 名称与现有流重复返回 AlreadyExists
    /// - 平台流解析失败时不保留任何记录
    pub async fn add_stream(&self, name: &str, url: &str) -> Result<StreamRecord> {
        let kind = classify_url(url)?;

        let id = generate_id();
        let name = if name.trim().is_empty() {
            format!("Stream {}", &id[..6])
        } else {
            name.trim().to_string()
        };
        if self.store.find_by_name(&name).is_some() {
            return Err(Error::AlreadyExists(name));
        }

        let mut record = StreamRecord {
            output_dir: PathBuf::from(&self.config.server.hls_root).join(&id),
            id,
            name,
            source_url: url.to_string(),
            resolved_url: url.to_string(),
            kind,
            status: StreamStatus::Starting,
            created_at: Utc::now(),
            last_token_refresh_at: None,
            restart_count: 0,
        };

        if kind == StreamKind::Platform {
            record.resolved_url = self.resolver.resolve(url).await?;
            record.last_token_refresh_at = Some(Utc::now());
        }

        let guard = self.lock_for(&record.id);
        let _g = guard.lock().await;

        self.store.upsert(record.clone());
        self.persist_reporting().await;

        record.status = self.launch(&record).await;
        self.store.update(&record.id, |r| r.status = record.status);

        info!("Stream [{}] ({}) added as {:?}", record.id, record.name, record.kind);
        Ok(record)
    }

    /// 停止并删除一条流，输出目录保留
    pub async fn remove_stream(&self, id: &str) -> Result<()> {
        let guard = self.lock_for(id);
        let _g = guard.lock().await;

        // 先取消挂起的解析调用和重试定时
        if let Some(token) = self.cancels.lock().unwrap().remove(id) {
            token.cancel();
        }

        if self.store.remove(id).is_none() {
            return Err(Error::NotFound(id.to_string()));
        }

        let _ = self.engine.stop(id).await;
        self.recovery.lock().unwrap().remove(id);
        self.persist_reporting().await;
        // id 不复用，串行锁随流一起退场
        self.locks.lock().unwrap().remove(id);

        info!("Stream [{}] removed", id);
        Ok(())
    }

    /// 不改变 id / name / source_url，只重启底层进程；
    /// 平台流会先重新解析 token。崩溃计数清零。
    pub async fn restart_stream(&self, id: &str) -> Result<StreamRecord> {
        let guard = self.lock_for(id);
        let _g = guard.lock().await;

        let record = self
            .store
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Stream [{}] restart requested", id);
        self.relaunch(record, true).await
    }

    pub fn list_streams(&self) -> Vec<StreamRecord> {
        self.store.list_all()
    }

    pub fn get_stream(&self, id: &str) -> Option<StreamRecord> {
        self.store.get(id)
    }

    /// 该流当前是否有存活的转码进程
    pub fn process_alive(&self, id: &str) -> bool {
        self.engine.is_alive(id)
    }

    // ------------------------------------------------------------------
    // 启动恢复与关机
    // ------------------------------------------------------------------

    /// 加载状态文件并恢复直连流
    ///
    /// 平台流的 token 在停机期间早已过期，保持 stopped，
    /// 由用户显式重启。
    pub async fn restore(self: &Arc<Self>) {
        let count = self.store.load().await;
        if count == 0 {
            info!("No streams to restore");
            return;
        }
        info!("Restoring {} stream(s) from state file", count);

        let mut tasks = JoinSet::new();
        for record in self.store.list_all() {
            match record.kind {
                StreamKind::Platform => {
                    info!(
                        "Stream [{}] ({}) is platform-backed, waiting for manual restart",
                        record.id, record.name
                    );
                }
                StreamKind::Direct => {
                    let manager = Arc::clone(self);
                    tasks.spawn(async move {
                        let guard = manager.lock_for(&record.id);
                        let _g = guard.lock().await;
                        let Some(record) = manager.store.get(&record.id) else {
                            return;
                        };
                        manager.restore_launch(record).await;
                    });
                }
            }
        }
        while tasks.join_next().await.is_some() {}
        self.persist_reporting().await;
    }

    /// 停机：停掉所有转码进程，注册表保持原样
    pub async fn shutdown(&self) {
        info!("Stopping all transcoders");
        for record in self.store.list_all() {
            if let Some(token) = self.cancels.lock().unwrap().remove(&record.id) {
                token.cancel();
            }
            let _ = self.engine.stop(&record.id).await;
        }
    }

    /// 消费进程退出通知；主动停止的退出在各操作内部收尾，这里忽略
    pub async fn run_exit_monitor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
        while let Some(event) = rx.recv().await {
            if event.requested {
                continue;
            }
            self.note_crash(&event.stream_id, event.code).await;
        }
    }

    // ------------------------------------------------------------------
    // 崩溃恢复与 token 刷新
    // ------------------------------------------------------------------

    /// 记一次非预期退出，按退避策略安排重试或放弃
    pub(crate) async fn note_crash(&self, id: &str, code: Option<i32>) {
        let Some(record) = self.store.get(id) else {
            return;
        };
        if matches!(record.status, StreamStatus::Stopped | StreamStatus::Failed) {
            return;
        }

        // 直连点播源播完即止，干净退出视为停止而非崩溃
        if code == Some(0) && record.kind == StreamKind::Direct {
            info!("Stream [{}] transcoder finished cleanly", id);
            self.store.update(id, |r| r.status = StreamStatus::Stopped);
            return;
        }

        let retry = &self.config.retry;
        enum Decision {
            GiveUp,
            Backoff(u32, u64),
        }
        let decision = {
            let mut recovery = self.recovery.lock().unwrap();
            let rec = recovery.entry(id.to_string()).or_insert_with(RecoveryState::new);
            let now = Instant::now();
            let window = Duration::from_secs(retry.window_sec);

            // 稳定运行超过窗口后才崩溃的，按新一轮故障重新计数
            if now.duration_since(rec.window_started_at) > window
                || now.duration_since(rec.last_started_at) > window
            {
                rec.crash_count = 0;
                rec.window_started_at = now;
            }
            rec.crash_count += 1;

            if retry.max_attempts > 0 && rec.crash_count > retry.max_attempts {
                rec.next_retry_at = None;
                Decision::GiveUp
            } else {
                let backoff = std::cmp::min(
                    retry.max_backoff_sec,
                    retry
                        .initial_backoff_sec
                        .saturating_mul(2u64.saturating_pow(rec.crash_count.saturating_sub(1))),
                );
                rec.next_retry_at = Some(now + Duration::from_secs(backoff));
                Decision::Backoff(rec.crash_count, backoff)
            }
        };

        match decision {
            Decision::GiveUp => {
                error!("{}", Error::CrashLoop(id.to_string()));
                self.store.update(id, |r| r.status = StreamStatus::Failed);
                self.persist_reporting().await;
            }
            Decision::Backoff(attempt, backoff) => {
                warn!(
                    "Stream [{}] crashed (code {:?}). Retry {}/{}. Backing off for {}s.",
                    id, code, attempt, retry.max_attempts, backoff
                );
                self.store.update(id, |r| {
                    r.status = StreamStatus::Starting;
                    r.restart_count = attempt;
                });
            }
        }
    }

    /// 平台流中 token 即将到期、需要刷新的流
    pub(crate) fn streams_due_for_refresh(&self) -> Vec<String> {
        self.store
            .list_all()
            .into_iter()
            .filter(|r| {
                r.kind == StreamKind::Platform
                    && r.status == StreamStatus::Running
                    && self.token_due(r)
            })
            .map(|r| r.id)
            .collect()
    }

    /// 退避到期、可以尝试重启的流
    pub(crate) fn streams_due_for_retry(&self) -> Vec<String> {
        let now = Instant::now();
        let due: Vec<String> = {
            let recovery = self.recovery.lock().unwrap();
            recovery
                .iter()
                .filter(|(_, rec)| rec.next_retry_at.map(|t| now >= t).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect()
        };
        due.into_iter()
            .filter(|id| {
                self.store
                    .get(id)
                    .map(|r| r.status == StreamStatus::Starting)
                    .unwrap_or(false)
            })
            .collect()
    }

    fn token_due(&self, record: &StreamRecord) -> bool {
        let refresh_after = self.config.token_refresh.refresh_after_secs();
        match record.last_token_refresh_at {
            Some(at) => (Utc::now() - at).num_seconds() >= refresh_after as i64,
            None => true,
        }
    }

    /// 每条到期流独立派生一个可取消的刷新任务，
    /// 慢解析只拖慢自己，不拖慢其他流
    pub(crate) fn spawn_refresh(self: &Arc<Self>, id: String) {
        let manager = Arc::clone(self);
        let token = self.cancel_token(&id);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = manager.refresh_stream(&id) => {}
            }
        });
    }

    pub(crate) fn spawn_retry(self: &Arc<Self>, id: String) {
        let manager = Arc::clone(self);
        let token = self.cancel_token(&id);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = manager.retry_stream(&id) => {}
            }
        });
    }

    /// 主动刷新 token：仅重启进程，流记录的 id / name 不变
    pub(crate) async fn refresh_stream(&self, id: &str) {
        let guard = self.lock_for(id);
        // 同 id 已有操作在进行，跳过本轮
        let Ok(_g) = guard.try_lock() else {
            return;
        };
        let Some(record) = self.store.get(id) else {
            return;
        };
        if record.kind != StreamKind::Platform
            || record.status != StreamStatus::Running
            || !self.token_due(&record)
        {
            return;
        }

        info!("Stream [{}]: proactive token refresh", id);
        match self.relaunch(record, false).await {
            Ok(_) => info!("Stream [{}]: token refreshed", id),
            Err(e) => warn!(
                "Stream [{}]: token refresh failed, keeping current process: {}",
                id, e
            ),
        }
    }

    /// 执行一次到期的自动重启
    pub(crate) async fn retry_stream(&self, id: &str) {
        let guard = self.lock_for(id);
        let Ok(_g) = guard.try_lock() else {
            return;
        };
        let Some(record) = self.store.get(id) else {
            return;
        };
        if record.status != StreamStatus::Starting {
            return;
        }
        {
            let mut recovery = self.recovery.lock().unwrap();
            match recovery.get_mut(id) {
                Some(rec) if rec.next_retry_at.map(|t| Instant::now() >= t).unwrap_or(false) => {
                    rec.next_retry_at = None;
                }
                _ => return,
            }
        }

        info!("Stream [{}]: attempting automatic restart", id);
        match self.relaunch(record, false).await {
            Ok(r) if r.status == StreamStatus::Running => {
                info!("Stream [{}]: restarted", id);
            }
            Ok(_) => {
                // 拉起失败继续计入退避，而不是就此定格
                self.store.update(id, |r| r.status = StreamStatus::Starting);
                self.note_crash(id, None).await;
            }
            Err(e) => {
                warn!("Stream [{}]: restart attempt failed: {}", id, e);
                self.note_crash(id, None).await;
            }
        }
    }

    /// 停掉旧进程并以当前 (或新解析的) 直连地址重新拉起
    ///
    /// 调用方必须已持有该流的串行锁。平台流解析失败时直接返回错误，
    /// 旧进程保持运行。
    async fn relaunch(&self, mut record: StreamRecord, reset_counter: bool) -> Result<StreamRecord> {
        if record.kind == StreamKind::Platform {
            record.resolved_url = self.resolver.resolve(&record.source_url).await?;
            record.last_token_refresh_at = Some(Utc::now());
        }

        let _ = self.engine.stop(&record.id).await;

        if reset_counter {
            record.restart_count = 0;
            self.recovery.lock().unwrap().remove(&record.id);
        }

        record.status = StreamStatus::Starting;
        self.store.upsert(record.clone());

        record.status = self.launch(&record).await;
        self.store.update(&record.id, |r| r.status = record.status);
        self.persist_reporting().await;

        Ok(record)
    }

    /// 恢复路径上的拉起，状态直接写回注册表
    async fn restore_launch(&self, mut record: StreamRecord) {
        self.store.update(&record.id, |r| r.status = StreamStatus::Starting);
        record.status = self.launch(&record).await;
        self.store.update(&record.id, |r| r.status = record.status);
    }
}
