use crate::error::Result;
use crate::manager::StreamManager;
use crate::stream::StreamRecord;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

/// 提供内嵌的管理后台页面
pub async fn index_handler() -> axum::response::Html<&'static str> {
    axum::response::Html(include_str!("../../static/index.html"))
}

/// 获取系统状态 API
/// 该处理函数返回系统的内存和负载信息，作为 JSON 响应
pub async fn sys_status() -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

fn record_json(manager: &StreamManager, record: &StreamRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id,
        "name": record.name,
        "source_url": record.source_url,
        "kind": record.kind,
        "status": record.status,
        "playlist_url": record.playlist_url(),
        "created_at": record.created_at,
        "last_token_refresh_at": record.last_token_refresh_at,
        "restart_count": record.restart_count,
        "process_alive": manager.process_alive(&record.id),
    })
}

/// 获取流列表 API
pub async fn list_streams(State(manager): State<Arc<StreamManager>>) -> Json<serde_json::Value> {
    let result: Vec<_> = manager
        .list_streams()
        .iter()
        .map(|record| record_json(&manager, record))
        .collect();

    Json(serde_json::json!({ "streams": result }))
}

#[derive(Debug, Deserialize)]
pub struct AddStreamRequest {
    #[serde(default)]
    pub name: String,
    pub url: String,
}

/// 登记新流 API
pub async fn handle_add(
    State(manager): State<Arc<StreamManager>>,
    Json(req): Json<AddStreamRequest>,
) -> Result<Json<serde_json::Value>> {
    let record = manager.add_stream(&req.name, &req.url).await?;
    Ok(Json(record_json(&manager, &record)))
}

/// 删除流 API，切片目录保留
pub async fn handle_remove(
    State(manager): State<Arc<StreamManager>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    manager.remove_stream(&id).await?;
    Ok(Json(serde_json::json!({ "removed": id })))
}

/// 手动重启流 API，平台流会先重新解析 token
pub async fn handle_restart(
    State(manager): State<Arc<StreamManager>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let record = manager.restart_stream(&id).await?;
    Ok(Json(record_json(&manager, &record)))
}
