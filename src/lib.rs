/// wsproxy 库入口
///
/// 将核心模块导出为库，方便集成测试和复用
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
mod io_util;
pub mod peek;
pub mod server;
pub mod socks5;
pub mod tls;
pub mod tunnel;
pub mod upstream;

// 重新导出常用类型
pub use config::{AuthFn, Config, CredentialStore, Encoding, UserInfo};
pub use error::{ProxyError, Result};
pub use peek::PeekableStream;
pub use server::{Server, ServerContext};
