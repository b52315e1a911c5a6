use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 全局错误分类
///
/// 校验类错误 (InvalidUrl / NotFound / AlreadyExists) 同步返回给调用方；
/// 进程与解析类错误 (LaunchFailed / ResolutionFailed) 记录并反映到流状态上；
/// 持久化错误不回滚内存状态，下一次成功写盘后自动对齐。
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid or unsupported stream URL: {0}")]
    InvalidUrl(String),

    #[error("stream already exists: {0}")]
    AlreadyExists(String),

    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("failed to launch transcoder: {0}")]
    LaunchFailed(String),

    #[error("failed to resolve platform URL: {0}")]
    ResolutionFailed(String),

    #[error("state persistence failed: {0}")]
    Persistence(String),

    #[error("stream [{0}] reached max retry attempts, giving up")]
    CrashLoop(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::ResolutionFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
