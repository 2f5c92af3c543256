use tokio::time::Instant;

/// Sleeps until `deadline`, backed by a timerfd on Linux for sub-millisecond pacing.
#[cfg(target_os = "linux")]
pub(crate) async fn sleep_until(deadline: Instant) {
    match tokio_timerfd::Delay::new(deadline.into_std()) {
        Ok(delay) => {
            if let Err(err) = delay.await {
                tracing::debug!("timerfd delay failed: {}", err);
                tokio::time::sleep_until(deadline).await;
            }
        }
        Err(_) => tokio::time::sleep_until(deadline).await,
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await
}
