//! Process counters and a minimal plaintext exposition endpoint.
//!
//! The exposition wire format is deliberately unspecified beyond
//! `name value` lines; scrapers that want a richer format sit behind a
//! sidecar. The endpoint binds only when a metrics address is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Shared atomic counters; cheap to clone behind an `Arc`.
#[derive(Debug, Default)]
pub struct Counters {
    pub tick_count: AtomicU64,
    pub tick_nanos_total: AtomicU64,
    pub entities: AtomicU64,
    pub players: AtomicU64,
    pub rep_bytes_total: AtomicU64,
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub transfers_started: AtomicU64,
    pub transfers_committed: AtomicU64,
    pub transfers_aborted: AtomicU64,
}

impl Counters {
    pub fn observe_tick(&self, d: Duration) {
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        self.tick_nanos_total
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_rep_bytes(&self, n: usize) {
        self.rep_bytes_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Renders the counters as `name value` lines.
    pub fn render(&self) -> String {
        let ticks = self.tick_count.load(Ordering::Relaxed);
        let total = self.tick_nanos_total.load(Ordering::Relaxed);
        let avg = if ticks > 0 { total / ticks } else { 0 };
        let mut out = String::with_capacity(256);
        out.push_str(&format!("tick_count {ticks}\n"));
        out.push_str(&format!("tick_avg_nanos {avg}\n"));
        out.push_str(&format!(
            "entities {}\n",
            self.entities.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "players {}\n",
            self.players.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "rep_bytes_total {}\n",
            self.rep_bytes_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "packets_in {}\n",
            self.packets_in.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "packets_out {}\n",
            self.packets_out.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "transfers_started {}\n",
            self.transfers_started.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "transfers_committed {}\n",
            self.transfers_committed.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "transfers_aborted {}\n",
            self.transfers_aborted.load(Ordering::Relaxed)
        ));
        out
    }
}

/// Serves the counters on `addr`, one response per connection. Runs until
/// the task is dropped with the owning process.
pub async fn serve(addr: String, counters: Arc<Counters>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("metrics bind {addr}"))?;
    debug!(%addr, "metrics endpoint up");
    serve_on(listener, counters).await
}

/// Serves on an already-bound listener.
pub async fn serve_on(listener: TcpListener, counters: Arc<Counters>) -> anyhow::Result<()> {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "metrics accept failed");
                continue;
            }
        };
        let body = counters.render();
        let resp = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(e) = stream.write_all(resp.as_bytes()).await {
            debug!(%peer, error = %e, "metrics write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_tick_average() {
        let c = Counters::default();
        c.observe_tick(Duration::from_nanos(100));
        c.observe_tick(Duration::from_nanos(300));
        let out = c.render();
        assert!(out.contains("tick_count 2"));
        assert!(out.contains("tick_avg_nanos 200"));
    }

    #[tokio::test]
    async fn endpoint_serves_counters() {
        let c = Arc::new(Counters::default());
        c.add_rep_bytes(123);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, c));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
            .await
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("rep_bytes_total 123"));
    }
}
