mod memory;
mod tcp;

use std::{collections::HashMap, io};

use comms::{
    OnoReceiver, OnoSender,
    msg::{Msg, Rank},
};
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinSet,
};

pub use memory::{MemoryBus, MemoryLink, memory_bus};
pub use tcp::{TcpBus, accept_peers, announce};

/// Capacity of the queue between the link readers and the dispatch loop.
const INBOX_CAPACITY: usize = 64;

/// Directed message delivery between the ranks of the group.
#[async_trait::async_trait]
pub trait Bus: Send {
    /// Delivers `msg` to `msg.receiver()`.
    async fn send(&mut self, msg: &Msg<'_>) -> io::Result<()>;

    /// Waits for the next message addressed to this rank.
    ///
    /// Messages of a single sender arrive in the order they were sent.
    async fn recv(&mut self) -> io::Result<Msg<'static>>;
}

/// A `Bus` built out of one comms link per peer.
///
/// Every link is drained by its own reader task into a single queue, so a slow
/// peer never blocks the messages of the others.
pub struct RankBus<W: AsyncWrite + Unpin + Send> {
    rank: Rank,
    links: HashMap<Rank, OnoSender<W>>,
    inbox: mpsc::Receiver<io::Result<Msg<'static>>>,
    inbox_tx: mpsc::Sender<io::Result<Msg<'static>>>,
    readers: JoinSet<()>,
}

impl<W: AsyncWrite + Unpin + Send> RankBus<W> {
    /// Creates a new `RankBus` with no links.
    ///
    /// # Arguments
    /// * `rank` - The rank owning the bus.
    pub fn new(rank: Rank) -> Self {
        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);

        Self {
            rank,
            links: HashMap::new(),
            inbox,
            inbox_tx,
            readers: JoinSet::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Whether there's a link to `peer`.
    pub fn is_linked(&self, peer: Rank) -> bool {
        self.links.contains_key(&peer)
    }

    /// The amount of linked peers.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Adds the link to `peer` and spawns its reader task.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Arguments
    /// * `peer` - The rank on the other side of the link.
    /// * `rx` - The receiving end of the link.
    /// * `tx` - The sending end of the link.
    ///
    /// # Errors
    /// Fails if `peer` is this bus' own rank or already linked.
    pub fn link<R>(&mut self, peer: Rank, mut rx: OnoReceiver<R>, tx: OnoSender<W>) -> io::Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if peer == self.rank {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {peer} can't link to itself"),
            ));
        }

        if self.is_linked(peer) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rank {peer} is already linked"),
            ));
        }

        self.links.insert(peer, tx);

        let inbox = self.inbox_tx.clone();
        self.readers.spawn(async move {
            let mut rx_buf: Vec<u32> = Vec::new();

            loop {
                let res = rx
                    .recv_into::<Msg, _>(&mut rx_buf)
                    .await
                    .and_then(|msg| check_sender(peer, msg));

                let failed = res.is_err();
                if inbox.send(res).await.is_err() || failed {
                    break;
                }
            }

            debug!(peer = peer; "link reader stopped");
        });

        debug!(rank = self.rank, peer = peer; "linked peer");
        Ok(())
    }

    /// Shuts down the sending end of every link, peers observe end of stream.
    ///
    /// The reader tasks are aborted once the bus is dropped.
    pub async fn close(mut self) -> io::Result<()> {
        let mut res = Ok(());

        for (peer, tx) in self.links.iter_mut() {
            if let Err(e) = tx.shutdown().await {
                warn!(peer = *peer; "failed to shut down link: {e}");
                res = Err(e);
            }
        }

        res
    }
}

fn check_sender(peer: Rank, msg: Msg<'_>) -> io::Result<Msg<'static>> {
    if msg.sender() != peer {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "link of rank {peer} carried a {} claiming to come from rank {}",
                msg.kind(),
                msg.sender()
            ),
        ));
    }

    Ok(msg.into_owned())
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Bus for RankBus<W> {
    async fn send(&mut self, msg: &Msg<'_>) -> io::Result<()> {
        let receiver = msg.receiver();
        let tx = self.links.get_mut(&receiver).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no link to rank {receiver}"),
            )
        })?;

        tx.send(msg).await
    }

    async fn recv(&mut self) -> io::Result<Msg<'static>> {
        if self.readers.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "the bus has no links to receive from",
            ));
        }

        // The bus holds a sender of its own inbox, it never closes while alive.
        self.inbox.recv().await.unwrap_or_else(|| {
            Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "the inbox was closed",
            ))
        })
    }
}
