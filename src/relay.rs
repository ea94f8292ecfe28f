use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, copy_bidirectional},
    net::TcpStream,
};
use tracing::{debug, info};

use crate::config::{SendProxy, TargetConfig};
use crate::header::{OriginalEndpoint, encode_v1, encode_v2};
use crate::stream::{ProxyStream, Transport};

/// Relays a classified connection to the configured target until either
/// side closes.
#[tracing::instrument(skip(stream, target), fields(client_addr = %stream.remote_addr()))]
pub async fn handle_connection<S: Transport>(
    mut stream: ProxyStream<S>,
    target: &TargetConfig,
) -> Result<()> {
    let target_addr = format!("{}:{}", target.host, target.port);

    debug!(target_addr = %target_addr, "Attempting to connect to target server");
    let mut upstream = TcpStream::connect(&target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;

    info!(
        target_addr = %target_addr,
        peer_addr = %stream.peer_addr(),
        version = ?stream.header().version(),
        "Connected to target server"
    );

    if let Some(send_proxy) = target.send_proxy {
        let endpoint = forwarded_endpoint(&stream);
        let header = match send_proxy {
            SendProxy::V1 => encode_v1(endpoint.as_ref()),
            SendProxy::V2 => encode_v2(endpoint.as_ref()),
        };
        upstream
            .write_all(&header)
            .await
            .context("Failed to send PROXY header to target")?;
    }

    let (from_client, from_target) = copy_bidirectional(&mut stream, &mut upstream)
        .await
        .context("Relay failed")?;

    info!(from_client, from_target, "Proxy connection closed");
    Ok(())
}

/// Endpoint to announce upstream: the one we were told about, else the
/// socket addresses of this connection.
fn forwarded_endpoint<S: Transport>(stream: &ProxyStream<S>) -> Option<OriginalEndpoint> {
    if let Some(endpoint) = stream.header().endpoint() {
        return Some(*endpoint);
    }
    let local = stream.local_addr().ok()?;
    OriginalEndpoint::new(stream.peer_addr(), local)
}
