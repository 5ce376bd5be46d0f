use std::{
    fmt::{self, Display},
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::{runtime, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    error::ServiceError,
    http::{DiscoveryService, HttpForwardService},
    socks5::{SocksForwardService, UdpEchoRelayService},
    telemetry::TelemetryStreamService,
    AppContext,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One independently running unit. `launch` binds whatever it needs and
/// serves until `shutdown` is cancelled or a fatal error occurs.
#[async_trait]
pub(crate) trait Service: Send {
    fn name(&self) -> &'static str;
    async fn launch(self: Box<Self>, shutdown: CancellationToken) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Signal,
}

/// Spawned service task. Resolves to the service name and its outcome.
pub(crate) struct ServiceHandle {
    name: &'static str,
    task: JoinHandle<Result<(), ServiceError>>,
}

impl ServiceHandle {
    fn spawn(service: Box<dyn Service>, shutdown: CancellationToken) -> Self {
        let name = service.name();
        debug!("Dispatch {}", name);
        Self {
            name,
            task: tokio::spawn(service.launch(shutdown)),
        }
    }
}

impl Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Future for ServiceHandle {
    type Output = (&'static str, Result<(), ServiceError>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let name = self.name;
        self.task.poll_unpin(cx).map(|joined| {
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(ServiceError::Panicked { service: name }),
                // Aborted by us while stopping
                Err(_) => Ok(()),
            };
            (name, result)
        })
    }
}

pub(crate) struct ServiceSupervisor {
    context: AppContext,
    state: Arc<Mutex<SupervisorState>>,
    shutdown: CancellationToken,
}

impl ServiceSupervisor {
    pub(crate) fn new(context: &AppContext) -> Self {
        Self {
            context: context.clone(),
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Shared view of the lifecycle state, readable while `run` is pending.
    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<Mutex<SupervisorState>> {
        self.state.clone()
    }

    fn transit(&self, to: SupervisorState) {
        let mut state = self.state.lock();
        debug!("Supervisor {:?} -> {:?}", *state, to);
        *state = to;
    }

    /// Services to launch for the current configuration, in dispatch order.
    pub(crate) fn plan(&self) -> Vec<Box<dyn Service>> {
        let context = &self.context;
        let mut services: Vec<Box<dyn Service>> = Vec::new();
        if context.socks_enabled() {
            services.push(Box::new(SocksForwardService::new(context)));
            services.push(Box::new(UdpEchoRelayService::new(context)));
        }
        if context.http_enabled() {
            services.push(Box::new(HttpForwardService::new(context)));
        }
        if context.discovery_enabled() {
            services.push(Box::new(DiscoveryService::new(context)));
        }
        if context.location_enabled {
            services.push(Box::new(TelemetryStreamService::new(context)));
        }
        services
    }

    /// Launch all enabled services and wait for `signal` or the first fatal
    /// error, then cancel every service and wait for them to release their
    /// sockets.
    pub(crate) async fn run<F>(self, signal: F) -> Result<StopReason, ServiceError>
    where
        F: Future<Output = ()>,
    {
        self.transit(SupervisorState::Starting);
        let mut handles: FuturesUnordered<ServiceHandle> = self
            .plan()
            .into_iter()
            .map(|service| ServiceHandle::spawn(service, self.shutdown.child_token()))
            .collect();
        info!("{} service(s) dispatched", handles.len());
        self.transit(SupervisorState::Running);

        tokio::pin!(signal);
        let outcome = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutting down...");
                    break Ok(StopReason::Signal);
                }
                Some((name, result)) = handles.next(), if !handles.is_empty() => match result {
                    Ok(()) => debug!("{} finished", name),
                    Err(err) => {
                        error!("{}", err);
                        break Err(err);
                    }
                },
            }
        };

        self.transit(SupervisorState::Stopping);
        self.shutdown.cancel();
        self.drain(handles).await;
        self.transit(SupervisorState::Stopped);
        outcome
    }

    async fn drain(&self, mut handles: FuturesUnordered<ServiceHandle>) {
        let drained = timeout(SHUTDOWN_GRACE, async {
            while let Some((name, result)) = handles.next().await {
                match result {
                    Ok(()) => debug!("{} stopped", name),
                    Err(err) => warn!("{} stopped with error: {}", name, err),
                }
            }
        })
        .await
        .is_ok();
        if !drained {
            for handle in handles.iter() {
                warn!("{} did not stop in time, abort it", handle);
                handle.task.abort();
            }
        }
    }
}

/// Run `future` to completion on a new multi-thread runtime.
///
/// Blocking reads that cannot be cancelled (a location device with no data)
/// are left behind after `RUNTIME_SHUTDOWN_GRACE` so the process can exit.
pub(crate) fn block_on<F: Future>(future: F) -> io::Result<F::Output> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    Ok(output)
}

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => (),
                    _ = sigterm.recv() => (),
                }
            }
            Err(err) => {
                warn!("Failed to listen SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        net::{SocketAddr, TcpListener},
        process::{self, Command},
        sync::mpsc,
        thread,
        time::Instant,
    };

    use tokio::{net::UdpSocket, sync::oneshot, time::sleep};

    use super::*;
    use crate::app::ProxyConfiguration;

    fn loopback(config: ProxyConfiguration) -> AppContext {
        ProxyConfiguration {
            bind_address: "127.0.0.1".parse().unwrap(),
            ..config
        }
        .into()
    }

    fn free_port() -> u16 {
        // Closed right away, racy but good enough on loopback
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn names(supervisor: &ServiceSupervisor) -> Vec<&'static str> {
        supervisor.plan().iter().map(|s| s.name()).collect()
    }

    #[test]
    fn nothing_planned_for_zero_ports() {
        let supervisor = ServiceSupervisor::new(&loopback(Default::default()));
        assert!(names(&supervisor).is_empty());
    }

    #[test]
    fn socks_port_brings_udp_relay() {
        let config = ProxyConfiguration {
            socks_port: 1080,
            http_port: 3128,
            ..Default::default()
        };
        let supervisor = ServiceSupervisor::new(&loopback(config));
        assert_eq!(
            names(&supervisor),
            ["SOCKSv5 proxy", "UDP relay", "HTTP proxy"]
        );
    }

    #[test]
    fn no_socks_without_socks_port() {
        let config = ProxyConfiguration {
            http_port: 3128,
            discovery_port: 8080,
            location_enabled: true,
            ..Default::default()
        };
        let supervisor = ServiceSupervisor::new(&loopback(config));
        assert_eq!(
            names(&supervisor),
            ["HTTP proxy", "PAC discovery", "location stream"]
        );
    }

    #[tokio::test]
    async fn stop_on_signal() {
        let socks_port = free_port();
        let config = ProxyConfiguration {
            socks_port,
            discovery_port: free_port(),
            ..Default::default()
        };
        let supervisor = ServiceSupervisor::new(&loopback(config));
        let state = supervisor.state();
        assert_eq!(*state.lock(), SupervisorState::Idle);

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(supervisor.run(async {
            let _ = rx.await;
        }));
        sleep(Duration::from_millis(200)).await;
        assert_eq!(*state.lock(), SupervisorState::Running);

        tx.send(()).unwrap();
        let reason = task.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Signal);
        assert_eq!(*state.lock(), SupervisorState::Stopped);

        // Sockets are released once stopped
        let addr: SocketAddr = ([127, 0, 0, 1], socks_port).into();
        UdpSocket::bind(addr).await.unwrap();
        TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn fatal_bind_error_stops_everything() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ProxyConfiguration {
            http_port: occupied.local_addr().unwrap().port(),
            discovery_port: free_port(),
            ..Default::default()
        };
        let supervisor = ServiceSupervisor::new(&loopback(config));
        let state = supervisor.state();
        let err = supervisor
            .run(futures::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Bind { .. }));
        assert_eq!(err.service(), "HTTP proxy");
        assert_eq!(*state.lock(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn finished_service_is_not_fatal() {
        let config = ProxyConfiguration {
            location_enabled: true,
            location_device: "/nonexistent/location".into(),
            ..Default::default()
        };
        let supervisor = ServiceSupervisor::new(&loopback(config));
        let reason = supervisor
            .run(sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::Signal);
    }

    #[tokio::test]
    async fn idle_until_signal_without_services() {
        let supervisor = ServiceSupervisor::new(&loopback(Default::default()));
        let reason = supervisor
            .run(sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(reason, StopReason::Signal);
    }

    #[cfg(unix)]
    #[test]
    fn exit_while_location_device_is_silent() {
        let fifo = std::env::temp_dir().join(format!("gatewayd-{}-silent", process::id()));
        let _ = fs::remove_file(&fifo);
        assert!(Command::new("mkfifo").arg(&fifo).status().unwrap().success());

        // Keep the write end open without writing, so reads block
        let (release, released) = mpsc::channel::<()>();
        let writer_path = fifo.clone();
        let writer = thread::spawn(move || {
            let _writer = fs::OpenOptions::new().write(true).open(writer_path).unwrap();
            let _ = released.recv();
        });

        let context = loopback(ProxyConfiguration {
            location_enabled: true,
            location_device: fifo.clone(),
            ..Default::default()
        });
        let started = Instant::now();
        let reason = block_on(async {
            ServiceSupervisor::new(&context)
                .run(sleep(Duration::from_millis(300)))
                .await
        })
        .unwrap();
        let elapsed = started.elapsed();

        release.send(()).unwrap();
        writer.join().unwrap();
        fs::remove_file(&fifo).unwrap();
        assert_eq!(reason.unwrap(), StopReason::Signal);
        assert!(elapsed < Duration::from_secs(3), "exit took {:?}", elapsed);
    }
}
