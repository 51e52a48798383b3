//! Zone links.
//!
//! The gateway dials one TCP connection per configured zone at startup. A
//! writer task owns the stream's write half behind a bounded channel so
//! callers never block on a slow link; a reader task decodes inbound
//! frames into the shared zone-message channel.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use arena_shared::frame::{read_frame, write_frame};
use arena_shared::ids::ZoneId;
use arena_shared::messages::LinkMsg;

/// Outbound queue depth per zone link.
const OUTBOUND_DEPTH: usize = 1024;

/// Handle to one zone's link; cheap to clone.
#[derive(Clone)]
pub struct ZoneLink {
    pub zid: ZoneId,
    tx: mpsc::Sender<LinkMsg>,
}

impl ZoneLink {
    /// Dials the zone and spawns its reader and writer tasks. Inbound
    /// messages land on `inbound` tagged with this zone's id.
    pub async fn connect(
        zid: ZoneId,
        addr: &str,
        inbound: mpsc::Sender<(ZoneId, LinkMsg)>,
    ) -> anyhow::Result<ZoneLink> {
        let sock_addr: SocketAddr = addr.parse().with_context(|| format!("parse zone addr {addr}"))?;
        let stream = TcpStream::connect(sock_addr)
            .await
            .with_context(|| format!("dial zone {} at {addr}", zid.0))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<LinkMsg>(OUTBOUND_DEPTH);
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(msg) = rx.recv().await {
                let (msg_type, payload) = msg.encode();
                if let Err(e) = write_frame(&mut writer, msg_type, &payload).await {
                    warn!(zone = zid.0, error = %e, "zone link write failed");
                    return;
                }
                // Flush once the burst is drained.
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        warn!(zone = zid.0, error = %e, "zone link flush failed");
                        return;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => match LinkMsg::decode(&frame) {
                        Ok(msg) => {
                            if inbound.send((zid, msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(zone = zid.0, error = %e, "undecodable zone frame");
                        }
                    },
                    Err(e) => {
                        warn!(zone = zid.0, error = %e, "zone link lost");
                        return;
                    }
                }
            }
        });

        Ok(ZoneLink { zid, tx })
    }

    /// Queues a message without blocking; a full or dead link drops it
    /// with a log line. Reliable-by-TCP once queued.
    pub fn send(&self, msg: LinkMsg) {
        if let Err(e) = self.tx.try_send(msg) {
            warn!(zone = self.zid.0, error = %e, "zone link send dropped");
        }
    }
}
