/// 错误类型定义
///
/// 使用 thiserror 定义精确的错误分类，启动路径仍可通过
/// anyhow 携带上下文（经 `Other` 透传）
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// wsproxy 的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 配置错误（文件不可读、JSON 解析失败等），启动即退出
    #[error("configuration error: {0}")]
    Config(String),

    /// 证书或私钥加载失败
    #[error("failed to load certificate material from {path:?}: {source}")]
    CertLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 监听器绑定或接受失败，只影响该监听器
    #[error("listener error on {addr}: {source}")]
    Listener {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 或 WebSocket 握手失败
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// 转发过程中的读写、压缩或解压错误，终止该会话
    #[error("relay error: {0}")]
    Relay(String),

    /// 首字节无法识别为任何已知协议
    #[error("unknown protocol, first byte 0x{0:02x}")]
    UnknownProtocol(u8),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（与 anyhow 兼容）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建握手错误
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    /// 创建转发错误
    pub fn relay(msg: impl Into<String>) -> Self {
        Self::Relay(msg.into())
    }

    /// 创建证书加载错误
    pub fn cert_load(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::CertLoad {
            path: path.into(),
            source,
        }
    }

    /// 是否为握手错误
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// 是否为转发错误
    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay(_))
    }
}
