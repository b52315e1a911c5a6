use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub token_refresh: TokenRefreshPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// HLS 切片存储根目录，每条流一个以 id 命名的子目录
    /// 建议配置为 /dev/shm/vtx-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 流注册表的持久化文件 (JSON)，重启后据此恢复
    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_supervisor_interval")]
    pub supervisor_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscoderConfig {
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,

    /// 输入前置参数，位于 -i 之前
    #[serde(default = "default_input_args")]
    pub input_args: Vec<String>,

    /// 输出参数，{output_dir} 会被替换为该流的切片目录
    #[serde(default = "default_output_args")]
    pub output_args: Vec<String>,

    /// 优雅停止的等待时间，超时后强制杀死进程
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: default_ffmpeg_binary(),
            input_args: default_input_args(),
            output_args: default_output_args(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

/// 外部解析器配置 (streamlink / yt-dlp 等)
///
/// 解析器把平台页面 URL 换成带时效 token 的直连地址，
/// {url} 会被替换为待解析的页面 URL。
#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_resolver_binary")]
    pub binary: String,
    #[serde(default = "default_resolver_args")]
    pub args: Vec<String>,
    #[serde(default = "default_resolver_timeout")]
    pub timeout_sec: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            binary: default_resolver_binary(),
            args: default_resolver_args(),
            timeout_sec: default_resolver_timeout(),
        }
    }
}

/// 故障重试策略
#[derive(Debug, Deserialize, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
    /// 滚动计数窗口 (秒)，进程持续运行超过该窗口后崩溃计数清零
    #[serde(default = "default_retry_window")]
    pub window_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_sec: 3,
            max_backoff_sec: 30,
            window_sec: default_retry_window(),
        }
    }
}

/// token 刷新策略
///
/// 平台流的直连地址带时效 token，在到期前 safety_margin_sec
/// 主动重新解析并仅重启转码进程，流记录本身保持不变。
#[derive(Debug, Deserialize, Clone)]
pub struct TokenRefreshPolicy {
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_sec: u64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_sec: u64,
}

impl Default for TokenRefreshPolicy {
    fn default() -> Self {
        Self {
            token_lifetime_sec: default_token_lifetime(),
            safety_margin_sec: default_safety_margin(),
        }
    }
}

impl TokenRefreshPolicy {
    /// 距上次解析多少秒后需要刷新
    pub fn refresh_after_secs(&self) -> u64 {
        self.token_lifetime_sec.saturating_sub(self.safety_margin_sec)
    }
}

fn default_hls_root() -> String {
    "./data/hls".to_string()
}

fn default_state_file() -> String {
    "./data/streams.json".to_string()
}

fn default_supervisor_interval() -> u64 {
    2000
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_input_args() -> Vec<String> {
    vec!["-hide_banner".into(), "-y".into()]
}

fn default_output_args() -> Vec<String> {
    [
        // 视频
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-g",
        "30",
        "-sc_threshold",
        "0",
        // 音频
        "-c:a",
        "aac",
        "-b:a",
        "128k",
        "-ac",
        "2",
        // HLS 切片
        "-f",
        "hls",
        "-hls_time",
        "2",
        "-hls_list_size",
        "10",
        "-hls_flags",
        "delete_segments+append_list",
        "-hls_segment_filename",
        "{output_dir}/seg_%03d.ts",
        "{output_dir}/stream.m3u8",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_resolver_binary() -> String {
    "streamlink".to_string()
}

fn default_resolver_args() -> Vec<String> {
    vec!["--stream-url".into(), "{url}".into(), "best".into()]
}

fn default_resolver_timeout() -> u64 {
    15
}

fn default_retry_window() -> u64 {
    300
}

fn default_token_lifetime() -> u64 {
    3600
}

fn default_safety_margin() -> u64 {
    600
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let yaml = "server:\n  listen: \"127.0.0.1:8080\"\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.transcoder.ffmpeg_binary, "ffmpeg");
        assert_eq!(config.resolver.binary, "streamlink");
        assert_eq!(config.retry.max_attempts, 5);
        // 默认 3600 - 600，即 50 分钟刷新一次
        assert_eq!(config.token_refresh.refresh_after_secs(), 3000);
    }

    #[test]
    fn retry_policy_can_be_overridden() {
        let yaml = r#"
server:
  listen: "127.0.0.1:8080"
retry:
  max_attempts: 2
  initial_backoff_sec: 1
  max_backoff_sec: 4
  window_sec: 60
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.window_sec, 60);
    }
}
