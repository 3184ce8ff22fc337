//! In-process network simulator
//!
//! Endpoints attach to a shared `SimNetwork` under a unique name. Opening a
//! session hands the remote half to the peer's accept queue; the two halves
//! are joined by a pair of tokio mpsc channels. Used by the integration tests
//! to run several nodes in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use super::{Session, Transport, TransportError};

const SESSION_BUFFER: usize = 64;
const ACCEPT_BUFFER: usize = 16;

/// The shared medium all simulated endpoints talk through.
pub struct SimNetwork {
    /// Endpoint name -> sender delivering incoming sessions to it.
    endpoints: Mutex<HashMap<String, mpsc::Sender<Box<dyn Session>>>>,
    sessions_opened: AtomicUsize,
    latency: Mutex<Duration>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            sessions_opened: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// Attach a new endpoint. Names are unique on a network.
    pub fn attach(
        self: &Arc<Self>,
        name: impl Into<String>,
    ) -> Result<SimEndpoint, TransportError> {
        let name = name.into();
        let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);

        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&name) {
            return Err(TransportError::ConnectionError(format!("{} is already attached", name)));
        }
        endpoints.insert(name.clone(), tx);

        Ok(SimEndpoint {
            name,
            network: Arc::clone(self),
            incoming: AsyncMutex::new(rx),
        })
    }

    /// Remove an endpoint. Sessions already open stay open.
    pub fn detach(&self, name: &str) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Total sessions opened on this network so far.
    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Delay applied to every send on sessions opened after this call.
    /// Uses tokio time, so paused clocks advance instantly in tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A named attachment to a `SimNetwork`. Detaches itself when dropped.
pub struct SimEndpoint {
    name: String,
    network: Arc<SimNetwork>,
    incoming: AsyncMutex<mpsc::Receiver<Box<dyn Session>>>,
}

impl SimEndpoint {
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }
}

impl Drop for SimEndpoint {
    fn drop(&mut self) {
        self.network.detach(&self.name);
    }
}

#[async_trait]
impl Transport for SimEndpoint {
    fn local_name(&self) -> &str {
        &self.name
    }

    async fn open_session(&self, peer: &str) -> Result<Box<dyn Session>, TransportError> {
        let sender = self
            .network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(peer.to_string()))?;

        let (ours, theirs) =
            SimSession::create_pair(&self.name, peer, self.network.latency());

        sender.send(Box::new(theirs)).await.map_err(|_| {
            TransportError::ConnectionError(format!("{} is no longer accepting sessions", peer))
        })?;

        self.network.sessions_opened.fetch_add(1, Ordering::SeqCst);
        log::debug!("{}: opened session {} to {}", self.name, ours.session_id, peer);
        Ok(Box::new(ours))
    }

    async fn accept(&self) -> Result<Box<dyn Session>, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }
}

/// One half of a simulated session.
pub struct SimSession {
    session_id: Uuid,
    peer: String,
    /// Taken on close; dropping the last sender is what the peer sees as EOF.
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    open: AtomicBool,
    latency: Duration,
}

impl SimSession {
    /// Create both halves of a session between `a` and `b`; the first half
    /// belongs to `a`.
    fn create_pair(a: &str, b: &str, latency: Duration) -> (SimSession, SimSession) {
        let session_id = Uuid::new_v4();
        let (tx_ab, rx_ab) = mpsc::channel(SESSION_BUFFER);
        let (tx_ba, rx_ba) = mpsc::channel(SESSION_BUFFER);

        let half = |peer: &str, tx, rx| SimSession {
            session_id,
            peer: peer.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            open: AtomicBool::new(true),
            latency,
        };

        (half(b, tx_ab, rx_ba), half(a, tx_ba, rx_ab))
    }
}

#[async_trait]
impl Session for SimSession {
    fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Disconnected)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        tx.send(data.to_vec())
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
