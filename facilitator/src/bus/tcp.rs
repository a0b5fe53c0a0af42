use std::io;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Hello, Rank},
};
use log::{info, warn};
use tokio::net::{
    TcpListener, TcpStream, ToSocketAddrs,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};

use super::RankBus;
use crate::config::FacilitatorConfig;

/// A bus whose links are tcp connections.
pub type TcpBus = RankBus<OwnedWriteHalf>;

/// Accepts a connection from every peer of the group.
///
/// Each peer announces itself with a `Hello` frame. Connections announcing a rank
/// outside the group, the facilitator's own rank or an already linked one are
/// dropped and the facilitator keeps waiting.
///
/// # Arguments
/// * `config` - The facilitator's configuration.
/// * `listener` - A bound listener.
///
/// # Returns
/// A bus linked to the whole group.
pub async fn accept_peers(config: &FacilitatorConfig, listener: &TcpListener) -> io::Result<TcpBus> {
    let mut bus = TcpBus::new(config.rank());
    let expected = config.peers().count();

    while bus.len() < expected {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = comms::channel(rx, tx);

        let mut rx_buf: Vec<u32> = Vec::new();
        let Hello { rank } = match rx.recv_into::<Hello, _>(&mut rx_buf).await {
            Ok(hello) => hello,
            Err(e) => {
                warn!("dropping connection from {addr}, bad handshake: {e}");
                continue;
            }
        };

        if rank >= config.world_size() || rank == config.rank() {
            warn!(rank = rank; "dropping connection from {addr}, rank isn't a peer");
            continue;
        }

        if let Err(e) = bus.link(rank, rx, tx) {
            warn!(rank = rank; "dropping connection from {addr}: {e}");
            continue;
        }

        info!(rank = rank; "peer connected from {addr} ({}/{expected})", bus.len());
    }

    Ok(bus)
}

/// Connects to the facilitator at `addr` and announces `rank`.
///
/// # Returns
/// The link to the facilitator.
pub async fn announce<A: ToSocketAddrs>(
    addr: A,
    rank: Rank,
) -> io::Result<(OnoReceiver<OwnedReadHalf>, OnoSender<OwnedWriteHalf>)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let (rx, tx) = stream.into_split();
    let (rx, mut tx) = comms::channel(rx, tx);
    tx.send(&Hello { rank }).await?;

    Ok((rx, tx))
}
