//! MQTT Broker
//!
//! Builds the registry, subscription trie and transport socket from a
//! [`Config`], starts the work-context pool and runs the TCP accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::spawn_workers;
use crate::policy::SharedPolicy;
use crate::registry::Registry;
use crate::topic::SubscriptionTrie;
use crate::transport::{bind_listener, serve_stream, Socket};

/// The MQTT Broker
pub struct Broker {
    config: Config,
    socket: Arc<Socket>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Shutdown signal for the accept loop
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    /// Create a broker whose exhaustion policy comes from the config.
    pub fn new(config: Config) -> Self {
        let policy = config.limits.policy();
        Self::with_policy(config, policy)
    }

    /// Create a broker with an explicit capacity policy.
    pub fn with_policy(config: Config, policy: SharedPolicy) -> Self {
        let registry = Arc::new(Registry::new(
            config.limits.max_pending_deliveries,
            policy.clone(),
        ));
        let trie = Arc::new(SubscriptionTrie::new(
            config.limits.max_topic_nodes,
            policy.clone(),
        ));
        let socket = Socket::new(config.transport_settings(), registry, trie, policy);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            socket,
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let backlog = i32::try_from(self.config.server.backlog).unwrap_or(i32::MAX);
        bind_listener(self.config.server.bind, backlog)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        if self.socket.is_closed() {
            return Ok(());
        }
        self.start_workers();

        info!(
            addr = %listener.local_addr()?,
            parallel = self.config.server.parallel,
            "MQTT/TCP listening"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("accept loop stopped");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New TCP connection from {}", addr);
                        self.handle_connection(stream, addr);
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }
        Ok(())
    }

    /// Start the work-context pool once.
    fn start_workers(&self) {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            *workers = spawn_workers(
                &self.socket,
                self.config.engine_settings(),
                self.config.server.parallel,
            );
        }
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_stream(socket, stream, addr).await {
                debug!("Connection error from {}: {}", addr, e);
            }
        });
    }

    /// Stop accepting, fail every waiting work context and close every
    /// pipe.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.socket.close();
        info!("broker shut down");
    }

    pub fn connection_count(&self) -> usize {
        self.socket.pipe_count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}
