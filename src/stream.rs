use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// 需要外部解析器换取直连地址的平台站点
const PLATFORM_HOSTS: &[&str] = &["twitch.tv", "youtube.com", "youtu.be"];

/// 可直接交给转码器的协议
const DIRECT_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "rtmps", "http", "https"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// 源地址本身即可播放 (RTSP / RTMP / HTTP / HLS)
    Direct,
    /// 页面 URL，需经外部解析器换取带时效 token 的直连地址
    Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// 一条用户可见的流记录
///
/// 进程句柄不在记录内，由进程管理侧独占持有，这里只通过 id 关联。
/// 落盘内容即本结构序列化结果，重载后状态统一归位为 stopped。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub name: String,
    /// 用户给出的原始地址
    pub source_url: String,
    /// 当前交给转码器的直连地址；直连流恒等于 source_url，
    /// 平台流在每次 token 刷新后更新
    pub resolved_url: String,
    pub kind: StreamKind,
    pub status: StreamStatus,
    pub output_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_token_refresh_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

impl StreamRecord {
    pub fn playlist_url(&self) -> String {
        format!("/hls/{}/stream.m3u8", self.id)
    }
}

/// 生成 12 位十六进制的流 id
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// 将输入 URL 归类为直连流或平台流
///
/// # 错误处理
/// - 无法解析或协议不受支持时返回 InvalidUrl
pub fn classify_url(raw: &str) -> Result<StreamKind> {
    let parsed =
        Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;

    if !DIRECT_SCHEMES.contains(&parsed.scheme()) {
        return Err(Error::InvalidUrl(format!(
            "unsupported scheme '{}' in {}",
            parsed.scheme(),
            raw
        )));
    }

    // 平台页面只会以 http(s) 形式出现
    if matches!(parsed.scheme(), "http" | "https") {
        if let Some(host) = parsed.host_str() {
            let is_platform = PLATFORM_HOSTS
                .iter()
                .any(|p| host == *p || host.ends_with(&format!(".{}", p)));
            if is_platform {
                return Ok(StreamKind::Platform);
            }
        }
    }

    Ok(StreamKind::Direct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_schemes_classify_as_direct() {
        for url in [
            "rtsp://cam.local:554/main",
            "rtmp://ingest.example.com/live/key",
            "http://example.com/live/index.m3u8",
            "https://cdn.example.com/stream.m3u8",
        ] {
            assert_eq!(classify_url(url).unwrap(), StreamKind::Direct, "{}", url);
        }
    }

    #[test]
    fn platform_hosts_classify_as_platform() {
        for url in [
            "https://www.twitch.tv/somechannel",
            "https://twitch.tv/somechannel",
            "https://www.youtube.com/watch?v=abc123",
            "https://youtu.be/abc123",
        ] {
            assert_eq!(classify_url(url).unwrap(), StreamKind::Platform, "{}", url);
        }
    }

    #[test]
    fn lookalike_hosts_stay_direct() {
        // 后缀匹配必须落在域名边界上
        assert_eq!(
            classify_url("https://nottwitch.tv/foo").unwrap(),
            StreamKind::Direct
        );
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert!(matches!(classify_url("not a url"), Err(Error::InvalidUrl(_))));
        assert!(matches!(
            classify_url("file:///etc/passwd"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(
            classify_url("ftp://example.com/video"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn generated_ids_are_short_and_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
