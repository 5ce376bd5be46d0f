use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{fs::File, io::AsyncReadExt, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, trace, warn};

use super::{error::ServiceError, supervisor::Service, AppContext};

const SERVICE_NAME: &str = "location stream";
const READ_BUF_SIZE: usize = 256;

/// Best-effort reader of the location device. Never fatal: any failure ends
/// this service only.
#[derive(Debug)]
pub(crate) struct TelemetryStreamService {
    device: PathBuf,
    interval: Duration,
    verbose: bool,
}

impl TelemetryStreamService {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            device: context.location_device.clone(),
            interval: context.location_interval,
            verbose: context.verbose,
        }
    }

    /// Returns the number of samples read.
    #[instrument(skip_all, fields(device = ?self.device))]
    pub(crate) async fn stream(self, shutdown: CancellationToken) -> usize {
        info!("Starting location streaming");
        let mut file = match File::open(&self.device).await {
            Ok(file) => file,
            Err(err) => {
                warn!("Location device open error: {}", err);
                return 0;
            }
        };
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut samples = 0;
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = file.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("Location stream ended");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        warn!("Location read error: {}", err);
                        break;
                    }
                },
            };
            samples += 1;
            let sample = Bytes::copy_from_slice(&buf[..n]);
            if self.verbose {
                info!("Location data: {:?}", sample);
            } else {
                trace!("Location data: {:?}", sample);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => (),
            }
        }
        samples
    }
}

#[async_trait]
impl Service for TelemetryStreamService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn launch(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ServiceError> {
        self.stream(shutdown).await;
        Ok(())
    }
}
