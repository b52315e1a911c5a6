use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TranscoderConfig;
use crate::error::{Error, Result};

/// 转码进程退出通知
///
/// 由进程的守护任务异步投递给生命周期管理器，
/// 投递本身不阻塞其他流的监护。
#[derive(Debug, Clone)]
pub struct ExitEvent {
    pub stream_id: String,
    pub code: Option<i32>,
    /// 是否为主动请求的停止 (stop 或关机)，区别于崩溃
    pub requested: bool,
}

/// 转码进程管理契约
///
/// 每条流至多关联一个存活进程；句柄由实现方独占持有，
/// 调用方只能通过 stream_id 间接操作。
#[async_trait]
pub trait TranscoderEngine: Send + Sync {
    /// 启动转码进程。同 id 已有存活进程时不做任何事。
    async fn start(&self, stream_id: &str, resolved_url: &str, output_dir: &Path) -> Result<()>;

    /// 请求优雅停止，超过宽限期后强制杀死。返回是否存在被停止的进程。
    async fn stop(&self, stream_id: &str) -> Result<bool>;

    fn is_alive(&self, stream_id: &str) -> bool;
}

struct ProcessHandle {
    generation: u64,
    /// 用于优雅退出 (ffmpeg 在 stdin 收到 q 后收尾)，stop 时取走
    stdin: Option<tokio::process::ChildStdin>,
    kill: CancellationToken,
    requested: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

/// 基于 FFmpeg 的转码进程管理
pub struct FfmpegEngine {
    config: TranscoderConfig,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    processes: Arc<Mutex<HashMap<String, ProcessHandle>>>,
    generation: AtomicU64,
}

impl FfmpegEngine {
    pub fn new(config: TranscoderConfig, exit_tx: mpsc::UnboundedSender<ExitEvent>) -> Self {
        Self {
            config,
            exit_tx,
            processes: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// 清理输出目录里上一代进程留下的切片和播放列表，
    /// 播放器不应看到带旧时间戳的列表
    async fn prepare_output_dir(dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some("ts" | "m3u8" | "part") = path.extension().and_then(|e| e.to_str()) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    fn build_command(&self, resolved_url: &str, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.ffmpeg_binary);
        for arg in &self.config.input_args {
            cmd.arg(arg);
        }
        cmd.arg("-i").arg(resolved_url);

        // 替换输出路径变量
        let dir_str = output_dir.to_string_lossy();
        for arg in &self.config.output_args {
            cmd.arg(arg.replace("{output_dir}", &dir_str));
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl TranscoderEngine for FfmpegEngine {
    async fn start(&self, stream_id: &str, resolved_url: &str, output_dir: &Path) -> Result<()> {
        // 1. 同 id 已有存活进程则跳过
        {
            let processes = self.processes.lock().unwrap();
            if let Some(handle) = processes.get(stream_id) {
                if !*handle.exited.borrow() {
                    warn!("Stream [{}] already has a live transcoder, skipping start", stream_id);
                    return Ok(());
                }
            }
        }

        // 2. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                if mem.avail < 5120 {
                    return Err(Error::LaunchFailed(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    )));
                }
            }
            Err(e) => {
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 3. 准备输出目录
        Self::prepare_output_dir(output_dir)
            .await
            .map_err(|e| Error::LaunchFailed(format!("output dir {:?}: {}", output_dir, e)))?;

        info!("Starting transcoder for [{}]. HLS Output: {:?}", stream_id, output_dir);

        // 4. 启动子进程
        let mut cmd = self.build_command(resolved_url, output_dir);
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn transcoder process: {}", e);
            Error::LaunchFailed(format!("spawn {}: {}", self.config.ffmpeg_binary, e))
        })?;

        let stdin = child.stdin.take();
        let last_stderr = Arc::new(Mutex::new(String::new()));

        // 5. stderr 旁路：降噪到 debug 级别，保留最后一行用于崩溃诊断
        if let Some(stderr) = child.stderr.take() {
            let id = stream_id.to_string();
            let last = Arc::clone(&last_stderr);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("transcoder[{}]: {}", id, line);
                    *last.lock().unwrap() = line;
                }
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let kill = CancellationToken::new();
        let requested = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = watch::channel(false);

        {
            let mut processes = self.processes.lock().unwrap();
            processes.insert(
                stream_id.to_string(),
                ProcessHandle {
                    generation,
                    stdin,
                    kill: kill.clone(),
                    requested: Arc::clone(&requested),
                    exited: exited_rx,
                },
            );
        }

        // 6. 守护任务：独占子进程，等待退出或强杀信号，
        //    清掉自己这一代的句柄后投递退出通知
        let processes = Arc::clone(&self.processes);
        let exit_tx = self.exit_tx.clone();
        let id = stream_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
                status = child.wait() => status,
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Process monitor error [{}]: {}", id, e);
                    None
                }
            };
            let was_requested = requested.load(Ordering::SeqCst);

            if was_requested {
                info!("Transcoder for [{}] stopped (code {:?})", id, code);
            } else {
                let tail = last_stderr.lock().unwrap().clone();
                warn!(
                    "Transcoder for [{}] exited unexpectedly (code {:?}). stderr: {}",
                    id, code, tail
                );
            }

            {
                let mut map = processes.lock().unwrap();
                if map.get(&id).map(|h| h.generation) == Some(generation) {
                    map.remove(&id);
                }
            }
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(ExitEvent {
                stream_id: id,
                code,
                requested: was_requested,
            });
        });

        Ok(())
    }

    async fn stop(&self, stream_id: &str) -> Result<bool> {
        let (stdin, kill, mut exited) = {
            let mut processes = self.processes.lock().unwrap();
            match processes.get_mut(stream_id) {
                Some(handle) if !*handle.exited.borrow() => {
                    handle.requested.store(true, Ordering::SeqCst);
                    (handle.stdin.take(), handle.kill.clone(), handle.exited.clone())
                }
                _ => return Ok(false),
            }
        };

        // 先礼后兵：ffmpeg 收到 q 后会写完当前切片再退出
        if let Some(mut pipe) = stdin {
            let _ = pipe.write_all(b"q\n").await;
            let _ = pipe.flush().await;
            drop(pipe);
        }

        let grace = Duration::from_millis(self.config.stop_grace_ms);
        if tokio::time::timeout(grace, exited.wait_for(|v| *v)).await.is_err() {
            warn!(
                "Transcoder for [{}] did not exit within {:?}, killing",
                stream_id, grace
            );
            kill.cancel();
            let _ = tokio::time::timeout(grace, exited.wait_for(|v| *v)).await;
        }

        Ok(true)
    }

    fn is_alive(&self, stream_id: &str) -> bool {
        self.processes
            .lock()
            .unwrap()
            .get(stream_id)
            .map(|h| !*h.exited.borrow())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // 用 sh 顶替 ffmpeg：-c 之后的脚本决定进程行为，
    // 引擎追加的 -i <url> 等参数只会成为被忽略的位置参数
    fn sh_config(script: &str, stop_grace_ms: u64) -> TranscoderConfig {
        TranscoderConfig {
            ffmpeg_binary: "sh".into(),
            input_args: vec!["-c".into(), script.into()],
            output_args: vec![],
            stop_grace_ms,
        }
    }

    #[tokio::test]
    async fn exit_is_reported_with_code() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = FfmpegEngine::new(sh_config("exit 7", 1000), tx);

        engine.start("s1", "rtsp://unused", dir.path()).await.unwrap();
        let event = rx.recv().await.unwrap();

        assert_eq!(event.stream_id, "s1");
        assert_eq!(event.code, Some(7));
        assert!(!event.requested);
        assert!(!engine.is_alive("s1"));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_and_marks_requested() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        // 进程不理会 stdin，只有强杀能结束它
        let engine = FfmpegEngine::new(sh_config("exec sleep 30", 100), tx);

        engine.start("s1", "rtsp://unused", dir.path()).await.unwrap();
        assert!(engine.is_alive("s1"));

        let stopped = engine.stop("s1").await.unwrap();
        assert!(stopped);

        let event = rx.recv().await.unwrap();
        assert!(event.requested);
        assert!(!engine.is_alive("s1"));
    }

    #[tokio::test]
    async fn stop_without_process_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = FfmpegEngine::new(sh_config("exit 0", 1000), tx);

        assert!(!engine.stop("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn second_start_on_live_process_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = FfmpegEngine::new(sh_config("exec sleep 30", 100), tx);

        engine.start("s1", "rtsp://unused", dir.path()).await.unwrap();
        engine.start("s1", "rtsp://unused", dir.path()).await.unwrap();

        engine.stop("s1").await.unwrap();
        let _ = rx.recv().await.unwrap();
        // 只有一个进程，第二次 start 没有产生新的退出事件
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_launch_failure() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = TranscoderConfig {
            ffmpeg_binary: "definitely-not-ffmpeg".into(),
            input_args: vec![],
            output_args: vec![],
            stop_grace_ms: 1000,
        };
        let engine = FfmpegEngine::new(config, tx);

        let err = engine.start("s1", "rtsp://unused", dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn stale_segments_are_cleaned_on_start() {
        let dir = TempDir::new().unwrap();
        let stale_ts = dir.path().join("seg_000.ts");
        let stale_playlist = dir.path().join("stream.m3u8");
        let unrelated = dir.path().join("notes.txt");
        tokio::fs::write(&stale_ts, b"x").await.unwrap();
        tokio::fs::write(&stale_playlist, b"x").await.unwrap();
        tokio::fs::write(&unrelated, b"x").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = FfmpegEngine::new(sh_config("exit 0", 1000), tx);
        engine.start("s1", "rtsp://unused", dir.path()).await.unwrap();
        let _ = rx.recv().await.unwrap();

        assert!(!stale_ts.exists());
        assert!(!stale_playlist.exists());
        assert!(unrelated.exists());
    }
}
