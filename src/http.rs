// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! HTTP 客户端公共部分 (ureq)

use std::sync::Arc;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("playback-counter/", env!("CARGO_PKG_VERSION"));

/// 构建带整体超时的 ureq Agent
///
/// `verify_tls == false` 时接受自签名证书 (代理常见部署方式)。
pub fn build_agent(verify_tls: bool, timeout: Duration) -> Result<ureq::Agent, native_tls::Error> {
    let mut builder = ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(USER_AGENT);

    if !verify_tls {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        builder = builder.tls_connector(Arc::new(connector));
    }

    Ok(builder.build())
}

/// 传输层错误是否为超时
pub fn is_timeout(transport: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(transport);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            );
        }
        source = err.source();
    }
    false
}
