mod config;
mod engine;
mod error;
mod manager;
mod resolver;
mod store;
mod stream;
mod supervisor;
mod web;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use engine::FfmpegEngine;
use manager::StreamManager;
use resolver::CommandResolver;
use std::sync::Arc;
use store::StreamStore;
use tokio::sync::mpsc;
use tracing::info;

/// VTX Relay - Live Stream Gateway
/// 解析命令行参数，初始化服务，恢复持久化的流，并启动HTTP服务及后台监控
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统，设置格式
    tracing_subscriber::fmt::init();

    // 解析命令行参数，获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!("VTX Relay initialized. HLS Root: {}", config.server.hls_root);

    // 组装核心组件：进程退出通知经由通道送达生命周期管理器
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(FfmpegEngine::new(config.transcoder.clone(), exit_tx));
    let resolver = Arc::new(CommandResolver::new(config.resolver.clone()));
    let store = StreamStore::new(&config.server.state_file);
    let manager = Arc::new(StreamManager::new(config.clone(), store, engine, resolver));

    // 恢复持久化的流（仅直连流自动拉起）
    manager.restore().await;

    // 启动退出事件监视与后台监控
    tokio::spawn(Arc::clone(&manager).run_exit_monitor(exit_rx));
    tokio::spawn(supervisor::start_supervisor(
        Arc::clone(&manager),
        config.server.supervisor_interval_ms,
    ));

    // 注册HTTP路由
    let app = Router::new()
        .route("/", get(web::admin::index_handler)) // 首页
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route(
            "/streams",
            get(web::admin::list_streams).post(web::admin::handle_add), // 流列表 / 登记新流
        )
        .route("/streams/:id", delete(web::admin::handle_remove)) // 删除流
        .route("/streams/:id/restart", post(web::admin::handle_restart)) // 重启流
        .route(
            "/hls/:stream_id/:file_name",
            get(web::hls::serve_hls_file), // 获取HLS文件
        )
        .with_state(Arc::clone(&manager));

    // 启动HTTP服务，监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// 等待 Ctrl+C，停掉所有转码进程后再退出
async fn shutdown_signal(manager: Arc<StreamManager>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("Received shutdown signal");
    manager.shutdown().await;
}
