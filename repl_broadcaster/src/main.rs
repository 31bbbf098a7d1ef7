use std::sync::Arc;

use anyhow::Context;
use log::{error, info, LevelFilter};
use repl_broadcaster::config;
use repl_broadcaster::ws_server::connection_manager::ConnectionManager;
use repl_broadcaster::ws_server::repl::run_repl;
use repl_broadcaster::ws_server::service::WsService;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 初始化日志记录器，RUST_LOG 可覆盖默认级别
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已初始化 (env_logger)，默认级别: Info。");

    config::init_config();
    let app_config = config::get_config()?;
    info!(
        "[主程序] 应用配置已加载，WebSocket 监听地址: {}:{}",
        app_config.websocket.host, app_config.websocket.port
    );

    let connection_manager = Arc::new(ConnectionManager::new());
    let ws_service = WsService::new(app_config.websocket.clone(), Arc::clone(&connection_manager));

    tokio::spawn(async move {
        if let Err(e) = run_repl(connection_manager).await {
            error!("[主程序] 控制台任务异常结束: {}", e);
        }
    });

    ws_service
        .start()
        .await
        .context("启动 WebSocket 服务失败")?;
    Ok(())
}
