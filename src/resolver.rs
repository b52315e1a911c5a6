use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};

/// 平台 URL 解析契约
///
/// 同一个页面 URL 每次解析都可能拿到不同的直连地址 (token 轮换)，
/// 调用方不做缓存，刷新节奏由生命周期管理器控制。
/// 解析失败不致命：现有进程和直连地址保持不动，等下一轮再试。
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn resolve(&self, page_url: &str) -> Result<String>;
}

/// 调用外部解析器 (streamlink / yt-dlp) 的实现
pub struct CommandResolver {
    config: ResolverConfig,
}

impl CommandResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, page_url: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{url}", page_url))
            .collect()
    }
}

#[async_trait]
impl UrlResolver for CommandResolver {
    async fn resolve(&self, page_url: &str) -> Result<String> {
        let args = self.build_args(page_url);
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let timeout = Duration::from_secs(self.config.timeout_sec);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::ResolutionFailed(format!(
                    "failed to run {}: {}",
                    self.config.binary, e
                )));
            }
            Err(_) => {
                warn!("Resolver timed out after {}s for {}", self.config.timeout_sec, page_url);
                return Err(Error::ResolutionFailed(format!(
                    "{} timed out after {}s",
                    self.config.binary, self.config.timeout_sec
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.trim().chars().take(200).collect();
            return Err(Error::ResolutionFailed(format!(
                "{} exited with {}: {}",
                self.config.binary, output.status, tail
            )));
        }

        // 取第一行能解析为 http(s) 的输出作为直连地址
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(parsed) = Url::parse(line) {
                if matches!(parsed.scheme(), "http" | "https") {
                    let shown: String = line.chars().take(120).collect();
                    info!("Resolved {} -> {}", page_url, shown);
                    return Ok(line.to_string());
                }
            }
        }

        Err(Error::ResolutionFailed(format!(
            "{} produced no usable URL for {}",
            self.config.binary, page_url
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_template_substitutes_url() {
        let resolver = CommandResolver::new(ResolverConfig {
            binary: "streamlink".into(),
            args: vec!["--stream-url".into(), "{url}".into(), "best".into()],
            timeout_sec: 15,
        });

        let args = resolver.build_args("https://twitch.tv/chan");
        assert_eq!(args, vec!["--stream-url", "https://twitch.tv/chan", "best"]);
    }

    #[tokio::test]
    async fn stdout_url_is_returned() {
        // 用 echo 顶替真实解析器
        let resolver = CommandResolver::new(ResolverConfig {
            binary: "echo".into(),
            args: vec!["https://cdn.example.com/live.m3u8?token=t1".into()],
            timeout_sec: 5,
        });

        let url = resolver.resolve("https://twitch.tv/chan").await.unwrap();
        assert_eq!(url, "https://cdn.example.com/live.m3u8?token=t1");
    }

    #[tokio::test]
    async fn non_url_output_is_resolution_failure() {
        let resolver = CommandResolver::new(ResolverConfig {
            binary: "echo".into(),
            args: vec!["stream is offline".into()],
            timeout_sec: 5,
        });

        let err = resolver.resolve("https://twitch.tv/chan").await.unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_resolution_failure() {
        let resolver = CommandResolver::new(ResolverConfig {
            binary: "definitely-not-a-resolver".into(),
            args: vec!["{url}".into()],
            timeout_sec: 5,
        });

        let err = resolver.resolve("https://twitch.tv/chan").await.unwrap_err();
        assert!(matches!(err, Error::ResolutionFailed(_)));
    }
}
