use nameplate::ClaimState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;

/// Health service name reported for the claimant.
pub const CLAIMANT_SERVICE: &str = "nameplate.Claimant";

pub fn status_for(state: &ClaimState) -> ServingStatus {
    match state {
        ClaimState::Holding { .. } => ServingStatus::Serving,
        _ => ServingStatus::NotServing,
    }
}

/// Serves the gRPC health protocol on `listener` until `shutdown` is
/// cancelled, reporting [`CLAIMANT_SERVICE`] as serving exactly while a slot
/// is held.
pub async fn serve(
    listener: TcpListener,
    states: watch::Receiver<ClaimState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let (reporter, health_service) = tonic_health::server::health_reporter();
    reporter
        .set_service_status(CLAIMANT_SERVICE, ServingStatus::NotServing)
        .await;

    tracing::info!(%addr, "serving health checks");
    let publisher = tokio::spawn(report_states(reporter, states));

    Server::builder()
        .add_service(health_service)
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown.cancelled_owned(),
        )
        .await?;

    publisher.abort();
    tracing::info!("health service shut down");
    Ok(())
}

async fn report_states(reporter: HealthReporter, mut states: watch::Receiver<ClaimState>) {
    loop {
        let status = status_for(&states.borrow_and_update());
        reporter
            .set_service_status(CLAIMANT_SERVICE, status)
            .await;
        if states.changed().await.is_err() {
            return;
        }
    }
}
