use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::debug;

use crate::manager::PortForwardError;

const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Retries a plain TCP connect to `127.0.0.1:<port>` until it succeeds or
/// `timeout` elapses. Says nothing about which process is listening.
pub async fn wait_ready(port: u16, timeout: Duration) -> Result<(), PortForwardError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let attempt =
            tokio::time::timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
                .await;
        if let Ok(Ok(_stream)) = attempt {
            debug!(event = "port_forward.ready", port, attempts, "port accepts connections");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(PortForwardError::NotReady { port, timeout });
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}
