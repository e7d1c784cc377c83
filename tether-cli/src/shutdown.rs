use tether_types::StopSignal;

/// Trip `stop` on ctrl-c or, on unix, SIGTERM.
pub fn listen(stop: StopSignal) {
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate() => tracing::info!("received SIGTERM, shutting down"),
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => tracing::info!("received ctrl-c, shutting down"),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for ctrl-c");
                    return;
                }
            },
            _ = stop.stopped() => return,
        }
        stop.stop();
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
