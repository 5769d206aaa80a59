/// TLS 配置加载
///
/// 服务端与客户端配置都把最低协议版本钉在 TLS 1.3。证书路径相对
/// 工作目录，CA 文件缺失时服务端仅记录错误并退化为不校验客户端
/// 证书，服务器证书加载失败则启动失败。
use crate::config::Config;
use crate::error::{ProxyError, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::error;

/// CA 证书束
pub const CA_CERTS: &str = ".wsproxy/certs/ca.crt";
/// 服务器证书
pub const SERVER_CERT: &str = ".wsproxy/certs/server.crt";
/// 服务器私钥
pub const SERVER_KEY: &str = ".wsproxy/certs/server.key";
/// 客户端证书（转发到上游时出示）
pub const CLIENT_CERT: &str = ".wsproxy/certs/client.crt";
/// 客户端私钥
pub const CLIENT_KEY: &str = ".wsproxy/certs/client.key";

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| ProxyError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| ProxyError::cert_load(path, e))?;
    if certs.is_empty() {
        return Err(ProxyError::cert_load(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "no certificates found"),
        ));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| ProxyError::cert_load(path, e))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::cert_load(path, e))?
        .ok_or_else(|| {
            ProxyError::cert_load(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "no private key found"),
            )
        })
}

/// 从 PEM 文件加载 CA 根证书池
pub fn load_ca_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| {
            ProxyError::Config(format!("bad CA certificate in {}: {}", path.display(), e))
        })?;
    }
    Ok(roots)
}

/// 加载服务端 TLS 配置，给出 CA 池时要求并校验客户端证书
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<RootCertStore>,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let config = match client_ca {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| ProxyError::Config(format!("client certificate verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ProxyError::Config(format!("bad server certificate: {}", e)))?;

    Ok(Arc::new(config))
}

/// 按配置构建隧道用的 TLS 接受器
pub fn build_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let client_ca = if config.verify_client_cert {
        match load_ca_roots(Path::new(CA_CERTS)) {
            Ok(roots) => Some(roots),
            Err(e) => {
                error!("open ca file error: {}", e);
                None
            }
        }
    } else {
        None
    };

    let server_config =
        load_server_config(Path::new(SERVER_CERT), Path::new(SERVER_KEY), client_ca)?;
    Ok(TlsAcceptor::from(server_config))
}

/// 加载客户端 TLS 配置
///
/// CA 文件存在则作为信任根，否则回退到系统根证书；`client_auth`
/// 给出证书和私钥路径时出示客户端证书。`skip_verify` 仅用于测试。
pub fn load_client_config(
    ca_cert_path: Option<&Path>,
    client_auth: Option<(&Path, &Path)>,
    skip_verify: bool,
) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = ca_cert_path {
        if ca_path.exists() {
            for cert in load_certs(ca_path)? {
                root_store.add(cert).map_err(|e| {
                    ProxyError::Config(format!(
                        "bad CA certificate in {}: {}",
                        ca_path.display(),
                        e
                    ))
                })?;
            }
        }
    }

    if root_store.is_empty() && !skip_verify {
        // 使用系统 CA 证书
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            root_store.add(cert).ok();
        }
    }

    let builder = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(root_store);

    let mut config = match client_auth {
        Some((cert_path, key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|e| ProxyError::Config(format!("bad client certificate: {}", e)))?,
        None => builder.with_no_client_auth(),
    };

    if skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(Arc::new(config))
}

/// 按配置构建转发到上游用的 TLS 连接器
pub fn build_connector(config: &Config) -> Result<TlsConnector> {
    let client_auth = if config.verify_client_cert {
        Some((Path::new(CLIENT_CERT), Path::new(CLIENT_KEY)))
    } else {
        None
    };
    let tls_config = load_client_config(Some(Path::new(CA_CERTS)), client_auth, false)?;
    Ok(TlsConnector::from(tls_config))
}

/// 生成自签名证书并写入指定路径，供测试环境搭建使用
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    let mut names = alt_names.to_vec();
    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert = generate_simple_self_signed(names)
        .map_err(|e| ProxyError::Config(format!("generate self-signed certificate: {}", e)))?;

    std::fs::write(cert_out, cert.cert.pem()).map_err(|e| ProxyError::cert_load(cert_out, e))?;
    std::fs::write(key_out, cert.signing_key.serialize_pem())
        .map_err(|e| ProxyError::cert_load(key_out, e))?;

    Ok(())
}

/// 不验证服务器证书的验证器（仅用于测试）
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
