// repl_broadcaster/src/ws_server/repl.rs

//! 标准输入控制台：每输入一行就广播给所有在线客户端。

use std::sync::Arc;

use log::info;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::error::AppError;
use crate::ws_server::connection_manager::ConnectionManager;

/// 列出在线客户端数量的控制台命令。
pub const CLIENTS_COMMAND: &str = "/clients";

/// 处理一行控制台输入，返回需要回显给操作者的文本。
pub fn handle_line(manager: &ConnectionManager, line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if line.trim() == CLIENTS_COMMAND {
        return Some(format!("在线客户端: {}", manager.client_count()));
    }

    let delivered = manager.broadcast(line, None);
    info!("[REPL] 已广播给 {} 个客户端: {}", delivered, line);
    Some(format!("已发送给 {delivered} 个客户端"))
}

/// 从任意行输入源读取并广播，直到输入结束。
pub async fn run_lines<R>(manager: Arc<ConnectionManager>, reader: R) -> Result<(), AppError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(feedback) = handle_line(&manager, &line) {
            println!("{feedback}");
        }
    }
    info!("[REPL] 标准输入已关闭，控制台退出。");
    Ok(())
}

/// 在标准输入上运行控制台。
pub async fn run_repl(manager: Arc<ConnectionManager>) -> Result<(), AppError> {
    println!("输入文本并回车即可广播给所有客户端；输入 {CLIENTS_COMMAND} 查看在线数量。");
    run_lines(manager, BufReader::new(tokio::io::stdin())).await
}
