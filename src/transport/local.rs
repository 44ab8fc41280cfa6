//! In-process transport
//!
//! Connects a fixed number of thread-workers with one unbounded crossbeam
//! channel per ordered rank pair, so messages between any two ranks arrive
//! in send order and `recv(src)` never observes traffic from other peers.
//! Host identifiers are assigned at build time, which lets tests exercise
//! multi-host topologies inside one process.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::wire;

/// Factory for a fully connected set of [`LocalTransport`] endpoints.
pub struct LocalMesh;

impl LocalMesh {
    /// Build one endpoint per entry of `hosts`; entry `i` becomes rank `i`
    /// reporting `hosts[i]` as its host identifier.
    pub fn build(hosts: &[&str]) -> Vec<LocalTransport> {
        let n = hosts.len();
        let mut senders: Vec<Vec<Sender<Vec<u8>>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut inboxes: Vec<Vec<Option<Receiver<Vec<u8>>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

        for src in 0..n {
            for dst in 0..n {
                let (tx, rx) = unbounded();
                senders[src].push(tx);
                inboxes[dst][src] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (peers, inbox))| LocalTransport {
                rank,
                size: n,
                host: hosts[rank].to_string(),
                peers,
                inboxes: inbox.into_iter().flatten().collect(),
                limit: wire::MAX_MESSAGE_LEN,
            })
            .collect()
    }

    /// Endpoints that all report the same host, for single-host scenarios.
    pub fn build_uniform(n: usize) -> Vec<LocalTransport> {
        Self::build(&vec!["localhost"; n])
    }
}

/// One rank's endpoint in a [`LocalMesh`].
pub struct LocalTransport {
    rank: usize,
    size: usize,
    host: String,
    peers: Vec<Sender<Vec<u8>>>,
    inboxes: Vec<Receiver<Vec<u8>>>,
    limit: usize,
}

impl LocalTransport {
    /// Lower the single-message ceiling, for exercising oversized-payload
    /// handling without gigabyte fixtures.
    pub fn with_max_message_len(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.size {
            return Err(Error::Transport(format!(
                "peer rank {peer} out of range for group of size {}",
                self.size
            )));
        }
        if peer == self.rank {
            return Err(Error::Transport(format!(
                "rank {} attempted a loopback transfer",
                self.rank
            )));
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dst: usize, message: Vec<u8>) -> Result<()> {
        self.check_peer(dst)?;
        self.peers[dst]
            .send(message)
            .map_err(|_| Error::Transport(format!("rank {dst} disconnected")))
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        self.check_peer(src)?;
        self.inboxes[src]
            .recv()
            .map_err(|_| Error::Transport(format!("rank {src} disconnected")))
    }

    fn host_id(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    fn max_message_len(&self) -> usize {
        self.limit
    }
}
