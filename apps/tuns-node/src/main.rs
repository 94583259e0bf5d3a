use anyhow::{Context, Result};
use core_mesh::upstream::HttpUpstream;
use core_mesh::{
    register_default_services, ProxyRouter, ServiceContext, ServiceManager, SwarmSubstrate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod identity;
mod socks;

use config::NodeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let (cfg, ignored) = NodeConfig::load().context("load configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    std::fs::create_dir_all(&cfg.log_dir)
        .with_context(|| format!("create log dir {}", cfg.log_dir.display()))?;
    let file_appender = rolling::daily(&cfg.log_dir, "tuns-node.log");
    let (nb_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(nb_writer.and(std::io::stderr))
        .compact()
        .init();

    for setting in &ignored {
        warn!(%setting, "ignoring unparseable override");
    }

    info!(version = %cfg.mesh.version, hosts = ?cfg.mesh.hosts, "tuns-node starting");

    let keypair = identity::load_or_create(&cfg.key_file).context("load node identity")?;
    let substrate =
        SwarmSubstrate::spawn(keypair, &cfg.mesh).context("start libp2p transport")?;
    info!(peer_id = %substrate.peer_id(), "transport up");

    let upstream = HttpUpstream::new(Duration::from_secs(cfg.mesh.router.request_timeout_secs))
        .context("build HTTP client")?;
    let ctx = ServiceContext::new(substrate.clone(), Arc::new(upstream), cfg.mesh.clone());

    let mut manager = ServiceManager::new(ctx.clone());
    register_default_services(&mut manager).context("register services")?;
    manager.start_all().await.context("start services")?;
    info!(services = ?manager.service_names(), "mesh services running");

    let router = ProxyRouter::new(ctx);

    let http_addr = format!("0.0.0.0:{}", cfg.http_port);
    let listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind {http_addr}"))?;
    info!(addr = %http_addr, "HTTP entrypoint listening");
    let app = http::build_router(http::AppState {
        router: router.clone(),
    });
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let socks = if cfg.socks_port != 0 {
        let addr = format!("127.0.0.1:{}", cfg.socks_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        Some(tokio::spawn(socks::run(listener, router)))
    } else {
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        joined = server => {
            match joined {
                Ok(Ok(())) => error!("HTTP server exited unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task failed"),
            }
        }
    }

    if let Some(socks) = socks {
        socks.abort();
    }
    manager.shutdown().await;
    substrate.shutdown().await;
    info!("tuns-node stopped");
    Ok(())
}
