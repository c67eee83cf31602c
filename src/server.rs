//! TCP listener for harness result connections.
//!
//! Accepts connections in a loop and hands each one to a spawned task.
//! A semaphore bounds how many handlers run at once; connections beyond
//! the bound wait for a permit instead of being rejected.

use crate::config::Config;
use crate::handler::{close, handle_connection, HandlerOptions};
use crate::log_sink::LogSink;
use socket2::SockRef;
use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    log: LogSink,
    options: Arc<HandlerOptions>,
    max_workers: u32,
    workers: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, log: LogSink) -> Self {
        let max_workers = u32::try_from(config.max_workers.max(1)).unwrap_or(u32::MAX);
        let options = Arc::new(HandlerOptions::from_config(&config));

        Server {
            config,
            log,
            options,
            max_workers,
            workers: Arc::new(Semaphore::new(max_workers as usize)),
        }
    }

    /// Bind the listening socket. Must be called within a Tokio runtime.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr();
        self.log.info(format!("Starting server on {}...", addr));

        create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind and serve until Ctrl-C
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(
            address = %self.config.bind_addr(),
            workers = self.max_workers,
            "Server listening"
        );

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install interrupt handler");
                std::future::pending::<()>().await;
            }
        })
        .await;

        Ok(())
    }

    /// Accept connections until `shutdown` resolves, then close the
    /// listener and give in-flight handlers `shutdown_grace` to finish.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.config.debug {
                            debug!(peer = %peer.ip(), "Got connection");
                        }
                        self.dispatch(stream, peer);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        self.log.warn("Received SIGINT; shutting down...");
        if let Err(e) = SockRef::from(&listener).shutdown(Shutdown::Both) {
            debug!(error = %e, "Listener shutdown failed");
        }
        drop(listener);

        self.drain().await;
        self.log.flush().await;
    }

    /// Number of handlers currently holding a worker slot
    pub fn active_workers(&self) -> usize {
        self.max_workers as usize - self.workers.available_permits()
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let workers = Arc::clone(&self.workers);
        let options = Arc::clone(&self.options);
        let log = self.log.clone();

        tokio::spawn(async move {
            // Closed only when shutdown abandons queued connections
            let Ok(_permit) = workers.acquire_owned().await else {
                debug!(peer = %peer, "Dropping queued connection");
                close(stream, peer);
                return;
            };
            handle_connection(stream, peer, &log, &options).await;
        });
    }

    /// Wait for every worker slot to come back, up to the grace period.
    /// Connections still queued or running after that are abandoned.
    async fn drain(&self) {
        let grace = self.config.shutdown_grace;
        match timeout(grace, self.workers.acquire_many(self.max_workers)).await {
            Ok(Ok(_all)) => debug!("All connection handlers finished"),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                in_flight = self.active_workers(),
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace elapsed; abandoning in-flight connections"
            ),
        }
        self.workers.close();
    }
}

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    Bind { addr: SocketAddr, source: io::Error },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } => Some(source),
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts don't trip over
/// sockets in TIME_WAIT.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeaderPolicy;
    use crate::log_sink::testing::{message, Capture};
    use crate::log_sink::Destination;
    use crate::packet::{encode, encode_with_header, READ_BUDGET};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn test_config(max_workers: usize) -> Config {
        Config {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 0,
            max_workers,
            log_file: None,
            quiet: true,
            debug: true,
            verbose_success_logging: true,
            header_policy: HeaderPolicy::Lenient,
            read_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            log_level: "info".to_string(),
        }
    }

    struct Harness {
        addr: SocketAddr,
        server: Arc<Server>,
        sink: LogSink,
        capture: Capture,
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<()>,
    }

    impl Harness {
        async fn start(config: Config) -> Self {
            let capture = Capture::default();
            let sink = LogSink::spawn(vec![Destination::writer("capture", capture.clone(), false)])
                .unwrap();
            let server = Arc::new(Server::new(config, sink.clone()));
            let listener = server.bind().unwrap();
            let addr = listener.local_addr().unwrap();

            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let task = tokio::spawn({
                let server = Arc::clone(&server);
                async move {
                    server
                        .serve(listener, async {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                }
            });

            Harness {
                addr,
                server,
                sink,
                capture,
                shutdown: Some(shutdown_tx),
                task,
            }
        }

        /// Send a payload and wait for the server to close the connection
        async fn send(&self, payload: &[u8]) {
            let mut stream = TcpStream::connect(self.addr).await.unwrap();
            stream.write_all(payload).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            assert!(rest.is_empty());
        }

        /// Result log messages, without the startup line
        async fn results(&self) -> Vec<String> {
            self.sink.flush().await;
            self.capture
                .lines()
                .iter()
                .map(|line| message(line).to_string())
                .filter(|msg| !msg.starts_with("Starting server on"))
                .collect()
        }

        async fn wait_for_active(&self, count: usize) {
            for _ in 0..200 {
                if self.server.active_workers() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "expected {} active workers, found {}",
                count,
                self.server.active_workers()
            );
        }

        async fn stop(mut self) -> Vec<String> {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            (&mut self.task).await.unwrap();
            self.results().await
        }
    }

    #[tokio::test]
    async fn test_success_entry() {
        let harness = Harness::start(test_config(4)).await;
        harness.send(&encode(42, 0)).await;
        assert_eq!(harness.results().await, vec!["Test run: 42, result: 0"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_crash_entry() {
        let harness = Harness::start(test_config(4)).await;
        harness.send(&encode(7, 11)).await;
        assert_eq!(harness.results().await, vec!["Test run: 7, result: 11"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_bad_header_warns_and_records() {
        let harness = Harness::start(test_config(4)).await;
        harness.send(&encode_with_header(b"XXXX", 1, 0)).await;
        assert_eq!(
            harness.results().await,
            vec!["Invalid header!", "Test run: 1, result: 0"]
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_bad_header_warns_and_records_crash() {
        let harness = Harness::start(test_config(4)).await;
        harness.send(&encode_with_header(b"XXXX", 1, 9)).await;
        assert_eq!(
            harness.results().await,
            vec!["Invalid header!", "Test run: 1, result: 9"]
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_garbage_does_not_disrupt_dispatcher() {
        let harness = Harness::start(test_config(4)).await;
        harness.send(b"\xde\xad\xbe\xef\x00").await;
        harness.send(b"").await;
        assert!(harness.results().await.is_empty());

        harness.send(&encode(5, 0)).await;
        assert_eq!(harness.results().await, vec!["Test run: 5, result: 0"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_surplus_bytes_ignored() {
        let harness = Harness::start(test_config(4)).await;
        let mut payload = encode(9, 0).to_vec();
        payload.resize(READ_BUDGET, 0xff);
        harness.send(&payload).await;
        assert_eq!(harness.results().await, vec!["Test run: 9, result: 0"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_fragmented_packet() {
        let harness = Harness::start(test_config(4)).await;
        let packet = encode(77, 3);

        let mut stream = TcpStream::connect(harness.addr).await.unwrap();
        stream.write_all(&packet[..6]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(&packet[6..]).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;

        assert_eq!(harness.results().await, vec!["Test run: 77, result: 3"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_connections() {
        let harness = Arc::new(Harness::start(test_config(8)).await);

        let mut clients = Vec::new();
        for id in 0..32u64 {
            let harness = Arc::clone(&harness);
            clients.push(tokio::spawn(async move {
                harness.send(&encode(id, (id % 3) as u8)).await;
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        let mut results = harness.results().await;
        results.sort();
        let mut expected: Vec<String> = (0..32u64)
            .map(|id| format!("Test run: {}, result: {}", id, id % 3))
            .collect();
        expected.sort();
        assert_eq!(results, expected);

        let harness = Arc::try_unwrap(harness).ok().unwrap();
        harness.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_bound_queues_excess() {
        let harness = Harness::start(test_config(2)).await;

        // Five idle peers: two occupy the workers, three wait in line
        let mut streams = Vec::new();
        for _ in 0..5 {
            streams.push(TcpStream::connect(harness.addr).await.unwrap());
        }
        harness.wait_for_active(2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.server.active_workers(), 2);

        for (id, stream) in streams.iter_mut().enumerate() {
            stream.write_all(&encode(id as u64, 1)).await.unwrap();
        }
        for stream in &mut streams {
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        }

        let mut results = harness.results().await;
        results.sort();
        assert_eq!(
            results,
            (0..5)
                .map(|id| format!("Test run: {}, result: 1", id))
                .collect::<Vec<_>>()
        );
        assert!(harness.server.active_workers() <= 2);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_listener() {
        let harness = Harness::start(test_config(4)).await;
        let addr = harness.addr;

        let results = harness.stop().await;
        assert_eq!(results, vec!["Received SIGINT; shutting down..."]);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight() {
        let harness = Harness::start(test_config(4)).await;
        let packet = encode(12, 0);

        let mut stream = TcpStream::connect(harness.addr).await.unwrap();
        stream.write_all(&packet[..4]).await.unwrap();
        harness.wait_for_active(1).await;

        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.write_all(&packet[4..]).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let results = harness.stop().await;
        finisher.await.unwrap();
        assert_eq!(
            results,
            vec!["Received SIGINT; shutting down...", "Test run: 12, result: 0"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_abandons_after_grace() {
        let mut config = test_config(4);
        config.shutdown_grace = Duration::from_millis(100);
        config.read_timeout = Duration::from_secs(30);
        let harness = Harness::start(config).await;

        let _idle = TcpStream::connect(harness.addr).await.unwrap();
        harness.wait_for_active(1).await;

        let results = timeout(Duration::from_secs(5), harness.stop())
            .await
            .unwrap();
        assert_eq!(results, vec!["Received SIGINT; shutting down..."]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queued_connections() {
        let mut config = test_config(1);
        config.shutdown_grace = Duration::from_millis(100);
        config.read_timeout = Duration::from_secs(30);
        let harness = Harness::start(config).await;

        let _busy = TcpStream::connect(harness.addr).await.unwrap();
        harness.wait_for_active(1).await;
        let mut queued = TcpStream::connect(harness.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.stop().await;

        let mut rest = Vec::new();
        let closed = timeout(Duration::from_secs(5), queued.read_to_end(&mut rest))
            .await
            .unwrap();
        assert_eq!(closed.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(1);
        config.bind_port = occupied.local_addr().unwrap().port();

        let sink = LogSink::spawn(Vec::new()).unwrap();
        let server = Server::new(config, sink);
        let err = server.bind().unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:"));
    }
}
