use crate::manager::StreamManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 启动后台监控任务，定期检查流的状态并进行 token 刷新和故障重试
///
/// # 任务流程：
/// - 每隔指定的时间间隔扫描一次注册表
/// - 平台流的 token 临近过期时重新解析并仅重启转码进程
/// - 崩溃后退避到期的流尝试自动重启
///
/// 每条到期流的工作都派生为独立的可取消任务并在各自的
/// 串行锁下执行：某条流的解析器调用再慢，也不会推迟其他
/// 流的刷新或重试，移除流时任务随之取消。
pub async fn start_supervisor(manager: Arc<StreamManager>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

    loop {
        interval.tick().await; // 等待指定的时间间隔

        // --- 阶段 1: 平台流 token 刷新 ---
        for id in manager.streams_due_for_refresh() {
            debug!("Supervisor: token refresh due for [{}]", id);
            manager.spawn_refresh(id);
        }

        // --- 阶段 2: 崩溃流重试 ---
        for id in manager.streams_due_for_retry() {
            debug!("Supervisor: retry due for [{}]", id);
            manager.spawn_retry(id);
        }
    }
}
