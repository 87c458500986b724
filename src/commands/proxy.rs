use super::Context;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portree::proxy::{cert_paths, load_server_config, ProxyServer, Resolver};
use portree::state::{ProxyState, Status};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Run the reverse proxy in the foreground until SIGINT/SIGTERM.
pub async fn start(ctx: &Context, tls: bool) -> anyhow::Result<()> {
    let store = ctx.store()?;
    let resolver = Arc::new(Resolver::new(ctx.config.clone(), store.clone()));

    let tls_config = if tls {
        let (cert, key) = cert_paths(&ctx.state_dir());
        Some(load_server_config(&cert, &key)?)
    } else {
        None
    };

    let server = ProxyServer::new(resolver, tls_config);
    let scheme = server.scheme();

    let proxy_ports: BTreeMap<String, u16> = ctx
        .config
        .services
        .iter()
        .map(|(name, svc)| (name.clone(), svc.proxy_port))
        .collect();

    server.start(&proxy_ports).await?;

    let record = store
        .with_lock(|| {
            let mut st = store.load()?;
            st.proxy = ProxyState {
                pid: std::process::id(),
                status: Status::Running,
                https: tls,
            };
            store.save(&st)
        })
        .await;
    if let Err(e) = record {
        tracing::warn!("failed to save proxy state: {e}");
    }

    println!("Proxy started:");
    for (name, port) in &proxy_ports {
        println!("  :{port} → {name}");
    }
    println!("\nAccess your services at:");
    println!("  {scheme}://<branch-slug>.localhost:<proxy_port>");

    wait_for_shutdown_signal().await;

    println!("\nStopping proxy...");
    server.stop().await;

    let record = store
        .with_lock(|| {
            let mut st = store.load()?;
            st.proxy = ProxyState {
                status: Status::Stopped,
                ..Default::default()
            };
            store.save(&st)
        })
        .await;
    if let Err(e) = record {
        tracing::warn!("failed to update proxy state: {e}");
    }

    println!("Proxy stopped.");
    Ok(())
}

/// Signal a recorded proxy process to stop.
pub async fn stop(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.store()?;
    let state = store.with_lock(|| store.load()).await?;

    if state.proxy.pid > 0 && state.proxy.status == Status::Running {
        let pid = Pid::from_raw(state.proxy.pid as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            tracing::warn!("failed to send SIGTERM to proxy process {pid}: {e}");
        }

        let record = store
            .with_lock(|| {
                let mut st = store.load()?;
                st.proxy = ProxyState {
                    status: Status::Stopped,
                    ..Default::default()
                };
                store.save(&st)
            })
            .await;
        if let Err(e) = record {
            tracing::warn!("failed to update proxy state: {e}");
        }

        println!("Proxy stopped.");
    } else {
        println!("Proxy is not running.");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
