use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use websocket_wire::TransportOptions;

use crate::error::AppError;

/// WebSocket 服务的默认主机地址
pub const DEFAULT_WS_HOST: &str = "0.0.0.0";
/// WebSocket 服务的默认端口号
pub const DEFAULT_WS_PORT: u16 = 8088;
/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "app_settings.json";

/// WebSocket 服务端详细配置结构体
///
/// 缺失的字段在反序列化时取默认值，旧版本的配置文件因此仍可加载。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WebSocketConfig {
    /// WebSocket 服务绑定的主机地址
    pub host: String,
    /// WebSocket 服务监听的端口号
    pub port: u16,
    /// 单帧载荷上限（字节），超过时以 1009 关闭连接
    pub max_payload_size: u64,
    /// 握手请求头上限（字节）
    pub max_handshake_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(), // 默认监听所有网络接口
            port: DEFAULT_WS_PORT,
            max_payload_size: TransportOptions::DEFAULT_MAX_PAYLOAD_SIZE,
            max_handshake_size: TransportOptions::DEFAULT_MAX_HANDSHAKE_SIZE,
        }
    }
}

impl WebSocketConfig {
    /// 解析监听地址。
    pub fn listen_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::ConfigError(format!("无效的监听地址 {}:{}: {}", self.host, self.port, e)))
    }

    /// 转换为协议层的连接参数。
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_payload_size: self.max_payload_size,
            max_handshake_size: self.max_handshake_size,
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// WebSocket 服务的相关配置
    pub websocket: WebSocketConfig,
}

// 全局静态应用配置实例
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// 从指定路径加载配置；文件不存在或已损坏时使用默认配置并写回该路径。
pub fn load_or_create_config(config_file_path: &Path) -> AppConfig {
    match fs::read_to_string(config_file_path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("[配置模块] 已成功从配置文件 {:?} 加载应用配置。", config_file_path);
                config
            }
            Err(e) => {
                warn!(
                    "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                    config_file_path, e
                );
                let default_config = AppConfig::default();
                save_config(&default_config, config_file_path);
                default_config
            }
        },
        Err(e) => {
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, config_file_path);
            default_config
        }
    }
}

/// 获取配置文件路径：优先当前目录，当前目录只读时退回到用户配置目录。
fn get_config_file_path() -> PathBuf {
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config_file_path = current_dir.join(CONFIG_FILE_NAME);

    let current_dir_writable = fs::metadata(&current_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);
    if config_file_path.exists() || current_dir_writable {
        return config_file_path;
    }

    let home_config = if let Ok(home) = env::var("HOME") {
        PathBuf::from(home).join(".config").join("repl_broadcaster")
    } else if let Ok(userprofile) = env::var("USERPROFILE") {
        PathBuf::from(userprofile).join("AppData").join("Local").join("repl_broadcaster")
    } else {
        return config_file_path;
    };
    home_config.join(CONFIG_FILE_NAME)
}

/// 保存配置到文件。失败只记录警告，不影响启动。
fn save_config(config: &AppConfig, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("[配置模块] 错误：创建配置目录 {:?} 失败: {}", parent, e);
                return;
            }
        }
    }

    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已成功将当前配置保存到 {:?}.", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e);
        }
    }
}

/// 初始化全局应用配置
pub fn init_config() {
    let loaded_config = load_or_create_config(&get_config_file_path());
    if APP_CONFIG.set(loaded_config).is_err() {
        warn!("[配置模块] 全局应用配置 APP_CONFIG 已被初始化，本次 init_config 调用未覆盖已有配置。请检查初始化流程。");
    }
    info!("[配置模块] 应用配置已成功初始化完毕。");
}

/// 获取已加载的全局应用配置
pub fn get_config() -> Result<&'static AppConfig, AppError> {
    APP_CONFIG
        .get()
        .ok_or_else(|| AppError::ConfigError("全局应用配置尚未初始化，请先调用 init_config()".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_config_path() -> PathBuf {
        env::temp_dir()
            .join(format!("repl_broadcaster_test_{}", Uuid::new_v4()))
            .join(CONFIG_FILE_NAME)
    }

    #[test]
    fn default_config_matches_constants() {
        let config = AppConfig::default();
        assert_eq!(config.websocket.host, DEFAULT_WS_HOST);
        assert_eq!(config.websocket.port, DEFAULT_WS_PORT);
        assert_eq!(config.websocket.transport_options(), TransportOptions::default());
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let path = temp_config_path();
        let config = load_or_create_config(&path);
        assert_eq!(config, AppConfig::default());
        assert!(path.exists(), "应写出默认配置文件");

        let reloaded = load_or_create_config(&path);
        assert_eq!(reloaded, config);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupted_file_falls_back_to_defaults() {
        let path = temp_config_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let config = load_or_create_config(&path);
        assert_eq!(config, AppConfig::default());
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<AppConfig>(&rewritten).is_ok(), "损坏的文件应被默认配置覆盖");
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: AppConfig = serde_json::from_str(r#"{ "websocket": { "port": 9001 } }"#).unwrap();
        assert_eq!(config.websocket.port, 9001);
        assert_eq!(config.websocket.host, DEFAULT_WS_HOST);
        assert_eq!(config.websocket.max_payload_size, TransportOptions::DEFAULT_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn listen_addr_validates_host() {
        let mut config = WebSocketConfig::default();
        assert_eq!(config.listen_addr().unwrap().port(), DEFAULT_WS_PORT);

        config.host = "not a host".to_string();
        assert!(matches!(config.listen_addr(), Err(AppError::ConfigError(_))));
    }
}
