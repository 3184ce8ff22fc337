//! Typed, time-bounded view of a transport session.

use std::time::Duration;

use uuid::Uuid;

use super::FlowError;
use crate::protocol::{FlowMessage, ProtocolId};
use crate::transport::{Session, Transport, TransportError};

pub struct FlowSession {
    inner: Box<dyn Session>,
    timeout: Duration,
}

impl FlowSession {
    pub fn new(inner: Box<dyn Session>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Open a session to `peer` and run the opening handshake for `protocol`.
    ///
    /// Fails with `Rejected` when the peer does not serve the protocol or does
    /// not accept us as initiator.
    pub async fn open(
        transport: &dyn Transport,
        peer: &str,
        protocol: ProtocolId,
        timeout: Duration,
    ) -> Result<Self, FlowError> {
        let inner = transport.open_session(peer).await?;
        let session = Self::new(inner, timeout);

        session
            .send(&FlowMessage::SessionInit {
                protocol,
                initiator: transport.local_name().to_string(),
            })
            .await?;

        match session.recv().await? {
            FlowMessage::SessionConfirm => Ok(session),
            other => {
                let err = other.unexpected("SessionConfirm");
                session.close().await;
                Err(err)
            }
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id()
    }

    /// Authenticated name of the counterparty.
    pub fn peer(&self) -> &str {
        self.inner.peer()
    }

    pub async fn send(&self, msg: &FlowMessage) -> Result<(), FlowError> {
        let bytes = msg.encode()?;
        self.inner.send(&bytes).await?;
        Ok(())
    }

    /// Next message, waiting at most the session timeout.
    pub async fn recv(&self) -> Result<FlowMessage, FlowError> {
        let bytes = tokio::time::timeout(self.timeout, self.inner.recv())
            .await
            .map_err(|_| TransportError::Timeout)??;
        FlowMessage::decode(&bytes)
    }

    /// Close the session. Closing twice, or after the peer went away, is fine.
    pub async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            log::debug!("Closing session {}: {}", self.session_id(), e);
        }
    }
}
