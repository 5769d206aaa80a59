/// 配置与用户凭据
///
/// JSON 配置文件一次性加载，运行期间只读。`Servers` 非空即为客户端
/// 模式（分类后的代理流量转发给上游），为空则本机直接提供代理服务。
use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// 隧道载荷的按消息编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum Encoding {
    /// 原样转发
    #[default]
    #[serde(rename = "")]
    None,
    /// 每帧一个自包含的 zlib 流
    #[serde(rename = "zlib")]
    Zlib,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::None => write!(f, "none"),
            Encoding::Zlib => write!(f, "zlib"),
        }
    }
}

/// 配置文件中的用户条目
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Passwd")]
    pub passwd: String,
}

/// 解码后的配置，字段名与 JSON 键一一对应，未知键忽略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 上游服务器列表，非空时按连接均匀随机选取一个
    #[serde(rename = "Servers")]
    pub servers: Vec<String>,

    /// 转发到上游时是否出示客户端证书；服务端相应要求校验
    #[serde(rename = "VerifyClientCert")]
    pub verify_client_cert: bool,

    /// 监听地址，非空时覆盖命令行给出的地址
    #[serde(rename = "ListenAddr")]
    pub listen_addr: String,

    /// 只开启 wss 隧道服务，不提供 socks5/http 代理
    #[serde(rename = "DisableProxy")]
    pub disable_proxy: bool,

    /// 认证用户列表，为空表示无需认证
    #[serde(rename = "Users")]
    pub users: Vec<UserInfo>,

    /// 隧道下游改连该 TCP 地址，留空则连本进程的 IPC 端点
    #[serde(rename = "UpstreamProxyServer")]
    pub upstream_proxy_server: String,

    /// 隧道载荷编码
    #[serde(rename = "Encoding")]
    pub encoding: Encoding,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            verify_client_cert: true,
            listen_addr: String::new(),
            disable_proxy: false,
            users: Vec::new(),
            upstream_proxy_server: String::new(),
            encoding: Encoding::None,
        }
    }
}

impl Config {
    /// 从 JSON 文件加载配置
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("open {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| ProxyError::Config(format!("decode {}: {}", path.display(), e)))
    }

    /// 是否为客户端模式（存在可转发的上游）
    pub fn is_client_mode(&self) -> bool {
        !self.servers.is_empty()
    }
}

/// 认证判定函数，入参为用户名和密码
pub type AuthFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// 用户名到密码的只读映射
#[derive(Debug, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// 由配置的用户列表构建，重复用户名以后出现者为准
    pub fn from_users(users: &[UserInfo]) -> Self {
        let users = users
            .iter()
            .map(|u| (u.user.clone(), u.passwd.clone()))
            .collect();
        Self { users }
    }

    /// 为空表示无需认证
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// 校验一对用户名密码
    pub fn verify(&self, user: &str, passwd: &str) -> bool {
        self.users.get(user).map(|p| p == passwd).unwrap_or(false)
    }

    /// 生成认证判定函数；无用户时返回 None，表示跳过认证
    pub fn auth_fn(&self) -> Option<AuthFn> {
        if self.users.is_empty() {
            return None;
        }
        let users = self.users.clone();
        Some(Arc::new(move |user: &str, passwd: &str| {
            users.get(user).map(|p| p == passwd).unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let json = r#"{
            "Servers": ["u1.example.com:443", "u2.example.com:443"],
            "VerifyClientCert": false,
            "ListenAddr": "0.0.0.0:1080",
            "DisableProxy": true,
            "Users": [{"User": "alice", "Passwd": "secret"}],
            "UpstreamProxyServer": "127.0.0.1:3128",
            "Encoding": "zlib"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(!config.verify_client_cert);
        assert_eq!(config.listen_addr, "0.0.0.0:1080");
        assert!(config.disable_proxy);
        assert_eq!(config.users[0].user, "alice");
        assert_eq!(config.upstream_proxy_server, "127.0.0.1:3128");
        assert_eq!(config.encoding, Encoding::Zlib);
        assert!(config.is_client_mode());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.servers.is_empty());
        // VerifyClientCert 缺省为 true
        assert!(config.verify_client_cert);
        assert!(!config.disable_proxy);
        assert!(config.users.is_empty());
        assert_eq!(config.encoding, Encoding::None);
        assert!(!config.is_client_mode());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let json = r#"{"ListenAddr": "127.0.0.1:1080", "FutureKnob": 42}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:1080");
    }

    #[test]
    fn test_empty_encoding_string_is_none() {
        let config: Config = serde_json::from_str(r#"{"Encoding": ""}"#).unwrap();
        assert_eq!(config.encoding, Encoding::None);
        assert_eq!(config.encoding.to_string(), "none");
        assert_eq!(Encoding::Zlib.to_string(), "zlib");
    }

    #[test]
    fn test_credential_store_verify() {
        let users = vec![
            UserInfo {
                user: "alice".into(),
                passwd: "secret".into(),
            },
            UserInfo {
                user: "bob".into(),
                passwd: "hunter2".into(),
            },
        ];
        let store = CredentialStore::from_users(&users);
        assert!(!store.is_empty());
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("carol", "secret"));
    }

    #[test]
    fn test_auth_fn_absent_iff_store_empty() {
        let empty = Arc::new(CredentialStore::from_users(&[]));
        assert!(empty.auth_fn().is_none());

        let users = vec![UserInfo {
            user: "alice".into(),
            passwd: "secret".into(),
        }];
        let store = Arc::new(CredentialStore::from_users(&users));
        let auth = store.auth_fn().unwrap();
        assert!(auth("alice", "secret"));
        assert!(!auth("alice", "nope"));
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wsproxy-test-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        std::fs::remove_file(&path).ok();
    }
}
