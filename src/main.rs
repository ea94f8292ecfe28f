use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info, warn};

use proxy_protocol_listener::{Error, ProxyProtocolListener, handle_connection, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from);
    let config = load_config(&config_path)?;
    let pp = &config.listen.proxy_protocol;
    info!(
        config_file = %config_path.display(),
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        allowed_proxy_ips = %pp.allowed_proxy_ips,
        header_timeout = pp.header_timeout,
        require_header = pp.require_header,
        target_host = %config.target.host,
        target_port = config.target.port,
        send_proxy = ?config.target.send_proxy,
        "Configuration loaded"
    );

    let addr = format!("{}:{}", config.listen.ip, config.listen.port);
    let listener = Arc::new(
        ProxyProtocolListener::bind(&addr, pp)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?,
    );

    info!(listen_addr = %addr, "PROXY protocol relay listening");

    tokio::spawn({
        let listener = listener.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown requested");
            listener.close();
        }
    });

    let mut incoming = Box::pin(listener.incoming());
    while let Some(result) = incoming.next().await {
        let stream = match result {
            Ok(stream) => stream,
            // The listener backs off on its own after fatal-looking errors
            Err(Error::Io(e)) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
            // Protocol violations only affect the offending connection
            Err(e) => {
                warn!(error = %e, "Dropped connection");
                continue;
            }
        };

        let target = config.target.clone();
        tokio::spawn(async move {
            let client_addr = stream.remote_addr();
            if let Err(e) = handle_connection(stream, &target).await {
                error!(client_addr = %client_addr, error = %e, "Connection failed");
            }
        });
    }

    info!("Listener stopped");
    Ok(())
}
