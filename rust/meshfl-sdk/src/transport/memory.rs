use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::transport::{Datagram, Transport, TransportError};

#[derive(Debug, Default)]
struct Network {
    max_message_size: usize,
    next_port: AtomicUsize,
    /// The amount every socket reports as buffered.
    buffered: AtomicUsize,
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Network {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Vec<u8>>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
/// A transport delivering messages within the process.
///
/// Clones share the same network: sockets bound by one clone can connect to
/// sockets bound by another.
pub struct MemoryTransport {
    network: Arc<Network>,
}

impl MemoryTransport {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            network: Arc::new(Network {
                max_message_size,
                ..Network::default()
            }),
        }
    }

    /// Gets the number of sockets bound so far.
    pub fn bound(&self) -> usize {
        self.network.next_port.load(Ordering::SeqCst)
    }

    /// Sets the number of bytes every socket of the network reports as buffered,
    /// to simulate a congested network.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.network.buffered.store(amount, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self) -> Result<Arc<dyn Datagram>, TransportError> {
        let port = self.network.next_port.fetch_add(1, Ordering::SeqCst);
        let candidate = format!("memory:{}", port);
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.endpoints().insert(candidate.clone(), tx);
        Ok(Arc::new(MemoryDatagram {
            candidate,
            network: self.network.clone(),
            inbox: AsyncMutex::new(rx),
            remote: Mutex::new(None),
        }))
    }

    fn max_message_size(&self) -> usize {
        self.network.max_message_size
    }
}

struct MemoryDatagram {
    candidate: String,
    network: Arc<Network>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    remote: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MemoryDatagram {
    fn remote(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<u8>>>> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Datagram for MemoryDatagram {
    fn local_candidate(&self) -> String {
        self.candidate.clone()
    }

    async fn connect(&self, candidate: &str) -> Result<(), TransportError> {
        let remote = self
            .network
            .endpoints()
            .get(candidate)
            .cloned()
            .ok_or_else(|| TransportError::UnknownCandidate(candidate.to_string()))?;
        *self.remote() = Some(remote);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.network.max_message_size {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "message too long",
            )));
        }
        match self.remote().as_ref() {
            Some(remote) => remote
                .send(data.to_vec())
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn buffered_amount(&self) -> usize {
        self.network.buffered.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.network.endpoints().remove(&self.candidate);
        self.remote().take();
        self.inbox.try_lock().map(|mut inbox| inbox.close()).ok();
    }
}

impl Drop for MemoryDatagram {
    fn drop(&mut self) {
        self.network.endpoints().remove(&self.candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_exchange() {
        let transport = MemoryTransport::new(16);
        let a = transport.bind().await.unwrap();
        let b = transport.clone().bind().await.unwrap();
        assert_eq!(transport.bound(), 2);

        assert!(matches!(
            a.send(b"ping").await.unwrap_err(),
            TransportError::NotConnected
        ));
        a.connect(&b.local_candidate()).await.unwrap();
        b.connect(&a.local_candidate()).await.unwrap();
        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping".to_vec());
        assert!(a.send(&[0; 17]).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_buffered_amount() {
        let transport = MemoryTransport::new(16);
        let a = transport.bind().await.unwrap();
        assert_eq!(a.buffered_amount(), 0);
        transport.set_buffered_amount(12);
        assert_eq!(a.buffered_amount(), 12);
    }

    #[tokio::test]
    async fn test_memory_close() {
        let transport = MemoryTransport::new(16);
        let a = transport.bind().await.unwrap();
        let b = transport.bind().await.unwrap();
        a.connect(&b.local_candidate()).await.unwrap();
        b.close();
        assert!(matches!(
            a.send(b"ping").await.unwrap_err(),
            TransportError::Closed
        ));
        assert!(matches!(
            a.connect(&b.local_candidate()).await.unwrap_err(),
            TransportError::UnknownCandidate(_)
        ));
    }
}
