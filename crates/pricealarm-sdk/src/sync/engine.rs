//! 同步引擎 - 每个集合一个实例的拉取/合并/推送循环
//!
//! 职责：
//! - initial_sync：首次拉取 + 双向合并（引擎生命周期内至多一次）
//! - poll_tick：定时拉取，远端更新时做单向整体替换
//! - 本地变更的防抖推送，带回声抑制与推送节流
//! - 所有定时器具名、可取消，teardown 时统一清理
//!
//! ## NOTE: 簿记状态全部显式
//!
//! All bookkeeping (hashes, timestamps, guard flags) lives in one explicit
//! `SyncState` owned by the engine instance. Nothing is captured in ambient
//! closures, and every tick reads current state at fire time, never a
//! snapshot taken when the callback was created.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{SyncEvent, SyncEventBus};
use crate::sync::merge::{content_hash, merge_initial, semantic_eq};
use crate::sync::store::StateStore;
use crate::sync::{CollectionKind, SyncTarget};

/// 引擎时序参数（参考值即默认值）
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// 拉取间隔
    pub poll_interval: Duration,
    /// 远端替换后的守卫清除延迟（替换引起的副作用不触发推送）
    pub settle_delay: Duration,
    /// 本地变更合并窗口（尾沿防抖）
    pub debounce_window: Duration,
    /// 两次推送尝试之间的全局最小间隔
    pub push_min_interval: Duration,
    /// 重试定时器的补偿余量
    pub retry_buffer: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3500),
            settle_delay: Duration::from_millis(1000),
            debounce_window: Duration::from_millis(500),
            push_min_interval: Duration::from_millis(1000),
            retry_buffer: Duration::from_millis(50),
        }
    }
}

/// 每集合引擎的显式簿记状态
#[derive(Debug, Default)]
pub struct SyncState {
    /// initial_sync 是否已启动（至多一次）
    pub initial_sync_started: bool,
    /// initial_sync 是否完成（拉取失败也置位，失败不能永久阻塞推送）
    pub initial_sync_complete: bool,
    /// 远端替换守卫：置位期间一切推送跳过
    pub processing_remote_update: bool,
    /// 已知的远端逻辑时钟
    pub last_known_remote_timestamp: i64,
    /// 最近一次从远端收到的内容哈希（回声抑制）
    pub last_received_hash: Option<String>,
    /// 最近一次成功推送的内容哈希（空转抑制）
    pub last_pushed_hash: Option<String>,
    /// 最近一次推送尝试时刻（节流窗口基准）
    pub last_push_attempt_at: Option<Instant>,
}

/// 具名定时器槽位
///
/// 同一槽位重复注册时旧任务被中止——重试定时器因此永不堆叠。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    PollLoop,
    ChangeListener,
    PushDebounce,
    PushRetry,
    GuardClear,
}

/// 定时器注册表 - 引擎自有，teardown 时统一取消
#[derive(Debug, Default)]
struct TimerRegistry {
    handles: Mutex<HashMap<TimerSlot, JoinHandle<()>>>,
}

impl TimerRegistry {
    /// 注册槽位任务；同槽位已有任务先中止
    fn replace(&self, slot: TimerSlot, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        if let Some(old) = handles.insert(slot, handle) {
            old.abort();
        }
    }

    fn cancel_all(&self) {
        let mut handles = self.handles.lock();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// 单集合同步引擎
pub struct SyncEngine {
    kind: CollectionKind,
    target: Arc<dyn SyncTarget>,
    store: Arc<dyn StateStore>,
    bus: SyncEventBus,
    config: SyncEngineConfig,
    state: Mutex<SyncState>,
    timers: TimerRegistry,
    /// 同一集合的拉取与推送互不交错（集合间相互独立）
    io_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        kind: CollectionKind,
        target: Arc<dyn SyncTarget>,
        store: Arc<dyn StateStore>,
        bus: SyncEventBus,
        config: SyncEngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            target,
            store,
            bus,
            config,
            state: Mutex::new(SyncState::default()),
            timers: TimerRegistry::default(),
            io_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    /// 读取当前簿记状态（观测/测试用）
    pub fn state_view(&self) -> SyncStateView {
        let state = self.state.lock();
        SyncStateView {
            initial_sync_complete: state.initial_sync_complete,
            processing_remote_update: state.processing_remote_update,
            last_known_remote_timestamp: state.last_known_remote_timestamp,
        }
    }

    /// 启动引擎：监听本地变更事件 + 拉取循环（首轮先跑 initial_sync）
    pub fn start(self: Arc<Self>) {
        // 本地变更监听：同集合的 LocalChanged 驱动防抖推送
        let listener = {
            let engine = Arc::clone(&self);
            let mut rx = self.bus.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(SyncEvent::LocalChanged(kind)) if kind == engine.kind => {
                            Arc::clone(&engine).schedule_local_change_push();
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // 落后不致命：补一次防抖推送即可覆盖错过的变更
                            warn!("[{}] 事件流落后 {} 条", engine.kind.as_str(), n);
                            Arc::clone(&engine).schedule_local_change_push();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        self.timers.replace(TimerSlot::ChangeListener, listener);

        // 拉取循环：失败的 tick 只记日志，不拆环
        let poll = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = Arc::clone(&engine).initial_sync().await {
                    warn!("[{}] 首次同步失败: {}", engine.kind.as_str(), e);
                }
                loop {
                    tokio::time::sleep(engine.config.poll_interval).await;
                    if engine.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(e) = Arc::clone(&engine).poll_tick().await {
                        warn!("[{}] 本轮拉取失败: {}", engine.kind.as_str(), e);
                    }
                }
            })
        };
        self.timers.replace(TimerSlot::PollLoop, poll);
    }

    /// 停止引擎：取消全部定时器任务，之后任何回调都不会再执行
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.timers.cancel_all();
        info!("[{}] 同步引擎已停止", self.kind.as_str());
    }

    /// 首次同步：拉取远端并做一次双向合并；引擎生命周期内至多执行一次
    ///
    /// 无论拉取成败，返回前都会置位 initial_sync_complete。
    pub async fn initial_sync(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.initial_sync_started {
                return Ok(());
            }
            state.initial_sync_started = true;
        }

        let outcome = self.initial_sync_inner().await;
        self.state.lock().initial_sync_complete = true;

        match outcome {
            Ok(needs_upload) => {
                if needs_upload {
                    // 合并结果比远端多出内容（本地先行编辑），补推一次
                    Arc::clone(&self).schedule_local_change_push();
                }
                Ok(())
            }
            Err(e) => {
                warn!("[{}] initial_sync 拉取/合并失败: {}", self.kind.as_str(), e);
                // 失败不外抛：推送闸门已打开，循环继续
                Ok(())
            }
        }
    }

    /// 返回合并结果是否需要回传远端
    async fn initial_sync_inner(&self) -> Result<bool> {
        let _io = self.io_lock.lock().await;

        let remote = match self.store.fetch(self.kind).await? {
            Some(remote) => remote,
            None => {
                debug!("[{}] 远端尚无快照，保留本地状态", self.kind.as_str());
                return Ok(false);
            }
        };

        let local = self.target.snapshot().await?;
        let merged = merge_initial(self.kind, &local, &remote.payload)?;

        {
            let mut state = self.state.lock();
            state.last_known_remote_timestamp = remote.timestamp;
            state.last_received_hash = Some(content_hash(self.kind, &remote.payload));
        }

        if !semantic_eq(self.kind, &merged, &local) {
            self.target.apply_remote(merged.clone()).await?;
        }

        let needs_upload = !semantic_eq(self.kind, &merged, &remote.payload);
        info!(
            "[{}] 首次同步完成: remote_ts={}, needs_upload={}",
            self.kind.as_str(),
            remote.timestamp,
            needs_upload
        );
        Ok(needs_upload)
    }

    /// 单轮拉取：远端时间戳更新且内容不同时做整体替换
    pub async fn poll_tick(self: Arc<Self>) -> Result<()> {
        let _io = self.io_lock.lock().await;

        let remote = match self.store.fetch(self.kind).await? {
            Some(remote) => remote,
            None => return Ok(()),
        };

        {
            let mut state = self.state.lock();
            if remote.timestamp <= state.last_known_remote_timestamp {
                return Ok(());
            }
            state.last_known_remote_timestamp = remote.timestamp;
        }

        let local = self.target.snapshot().await?;
        if semantic_eq(self.kind, &remote.payload, &local) {
            debug!(
                "[{}] 远端时间戳更新但内容一致，跳过替换: ts={}",
                self.kind.as_str(),
                remote.timestamp
            );
            return Ok(());
        }

        {
            let mut state = self.state.lock();
            state.processing_remote_update = true;
            state.last_received_hash = Some(content_hash(self.kind, &remote.payload));
        }

        if let Err(e) = self.target.apply_remote(remote.payload.clone()).await {
            // 替换失败必须立刻撤下守卫，否则本地推送被无限期压制
            self.state.lock().processing_remote_update = false;
            return Err(e);
        }
        info!(
            "[{}] 已整体替换为远端快照: ts={}",
            self.kind.as_str(),
            remote.timestamp
        );

        // 守卫清除定时器：替换触发的副作用在 settle 窗口内不引发推送
        let guard_clear = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(engine.config.settle_delay).await;
                engine.state.lock().processing_remote_update = false;
                debug!("[{}] 远端替换守卫已清除", engine.kind.as_str());
            })
        };
        self.timers.replace(TimerSlot::GuardClear, guard_clear);

        Ok(())
    }

    /// 本地变更入口：尾沿防抖后调用 push
    ///
    /// 由本集合的 LocalChanged 事件驱动；远端替换不会走到这里。
    pub fn schedule_local_change_push(self: Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let debounce = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(engine.config.debounce_window).await;
                Arc::clone(&engine).push().await;
            })
        };
        self.timers.replace(TimerSlot::PushDebounce, debounce);
    }

    /// 递归 async fn 需装箱以打破 Send 推断环（重试槽内自调用）
    fn push_boxed(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(self.push())
    }

    /// 守卫式推送，按序检查：未完成首次同步 / 远端替换守卫 /
    /// 节流窗口（单槽重试）/ 回声与空转哈希
    pub async fn push(self: Arc<Self>) {
        // 闸门检查只持锁不等待
        {
            let mut state = self.state.lock();
            if !state.initial_sync_complete {
                debug!("[{}] 首次同步未完成，跳过推送", self.kind.as_str());
                return;
            }
            if state.processing_remote_update {
                debug!("[{}] 正在应用远端更新，跳过推送", self.kind.as_str());
                return;
            }
            if let Some(last) = state.last_push_attempt_at {
                let elapsed = last.elapsed();
                if elapsed < self.config.push_min_interval {
                    let wait = self.config.push_min_interval - elapsed + self.config.retry_buffer;
                    debug!(
                        "[{}] 处于推送节流窗口内，{}ms 后重试",
                        self.kind.as_str(),
                        wait.as_millis()
                    );
                    drop(state);
                    // 单槽重试：新请求替换挂起的旧重试，绝不堆叠；
                    // 触发时重新读取现值，不携带旧快照
                    let retry = {
                        let engine = Arc::clone(&self);
                        tokio::spawn(async move {
                            tokio::time::sleep(wait).await;
                            Arc::clone(&engine).push_boxed().await;
                        })
                    };
                    self.timers.replace(TimerSlot::PushRetry, retry);
                    return;
                }
            }
            state.last_push_attempt_at = Some(Instant::now());
        }

        let _io = self.io_lock.lock().await;

        // 触发时刻读取现值
        let candidate = match self.target.snapshot().await {
            Ok(v) => v,
            Err(e) => {
                warn!("[{}] 读取本地快照失败，放弃本次推送: {}", self.kind.as_str(), e);
                return;
            }
        };
        let hash = content_hash(self.kind, &candidate);

        {
            let state = self.state.lock();
            if state.last_received_hash.as_deref() == Some(hash.as_str()) {
                debug!("[{}] 内容与刚收到的远端一致（回声），跳过推送", self.kind.as_str());
                return;
            }
            if state.last_pushed_hash.as_deref() == Some(hash.as_str()) {
                debug!("[{}] 内容与上次推送一致（空转），跳过推送", self.kind.as_str());
                return;
            }
        }

        match self.store.store(self.kind, candidate).await {
            Ok(timestamp) => {
                {
                    let mut state = self.state.lock();
                    state.last_pushed_hash = Some(hash);
                    // 自己写入产生的时间戳不算"远端更新"，避免下轮拉取自替换
                    if timestamp > state.last_known_remote_timestamp {
                        state.last_known_remote_timestamp = timestamp;
                    }
                }
                info!("[{}] 推送完成: ts={}", self.kind.as_str(), timestamp);
                self.bus.publish(SyncEvent::Pushed {
                    kind: self.kind,
                    timestamp,
                });
            }
            Err(e) => {
                warn!("[{}] 推送失败: {}", self.kind.as_str(), e);
            }
        }
    }

    /// 推送被取消的语义由槽位替换保证；测试用：取消挂起的防抖/重试
    #[cfg(test)]
    fn cancel_pending_pushes(&self) {
        let mut handles = self.timers.handles.lock();
        for slot in [TimerSlot::PushDebounce, TimerSlot::PushRetry] {
            if let Some(h) = handles.remove(&slot) {
                h.abort();
            }
        }
    }
}

/// 簿记状态的只读视图
#[derive(Debug, Clone, Copy)]
pub struct SyncStateView {
    pub initial_sync_complete: bool,
    pub processing_remote_update: bool,
    pub last_known_remote_timestamp: i64,
}
