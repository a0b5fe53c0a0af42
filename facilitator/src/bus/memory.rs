use std::{collections::HashMap, io};

use comms::{OnoReceiver, OnoSender, msg::Rank};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use super::RankBus;
use crate::config::FacilitatorConfig;

const LINK_CAPACITY: usize = 1 << 16;

/// A bus whose links are in-process pipes.
pub type MemoryBus = RankBus<WriteHalf<DuplexStream>>;

/// The peer's side of an in-process link.
pub type MemoryLink = (
    OnoReceiver<ReadHalf<DuplexStream>>,
    OnoSender<WriteHalf<DuplexStream>>,
);

/// Builds the facilitator's bus with an in-process link to every peer.
///
/// Must be called within a tokio runtime.
///
/// # Returns
/// The bus and the other end of each link, keyed by the peer's rank.
pub fn memory_bus(config: &FacilitatorConfig) -> io::Result<(MemoryBus, HashMap<Rank, MemoryLink>)> {
    let mut bus = MemoryBus::new(config.rank());
    let mut peers = HashMap::new();

    for peer in config.peers() {
        let (ours, theirs) = tokio::io::duplex(LINK_CAPACITY);

        let (rx, tx) = tokio::io::split(ours);
        let (rx, tx) = comms::channel(rx, tx);
        bus.link(peer, rx, tx)?;

        let (rx, tx) = tokio::io::split(theirs);
        peers.insert(peer, comms::channel(rx, tx));
    }

    Ok((bus, peers))
}
