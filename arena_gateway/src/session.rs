//! Gateway-side session state.
//!
//! A session is minted on a successful cookie + token handshake and keyed
//! by `SessionId`; the remote-address index tracks the latest observed
//! source address. One coarse lock protects the whole table; nothing here
//! suspends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use arena_shared::ids::{AccountId, CharacterId, SessionId, ZoneId};
use arena_shared::interest::Interest;
use arena_shared::limiter::TokenBucket;
use arena_shared::reliable::ReliablePeer;

/// One authenticated client.
pub struct Session {
    pub sid: SessionId,
    pub remote: SocketAddr,
    pub account: AccountId,
    /// 0 until the attach hello names a character.
    pub cid: CharacterId,
    /// 0 until attached; rewritten on transfer prepare.
    pub zone: ZoneId,
    pub interest: Interest,
    pub last_heard: Instant,
    pub peer: ReliablePeer,
    /// Paces outbound replication bytes toward this client.
    pub send_bucket: TokenBucket,
}

impl Session {
    pub fn new(
        sid: SessionId,
        remote: SocketAddr,
        account: AccountId,
        max_pending_bytes: usize,
        send_burst: u32,
        send_rate: u32,
        now: Instant,
    ) -> Self {
        Self {
            sid,
            remote,
            account,
            cid: CharacterId(0),
            zone: ZoneId(0),
            interest: Interest::all_channels(),
            last_heard: now,
            peer: ReliablePeer::new(max_pending_bytes),
            send_bucket: TokenBucket::new(send_burst, send_rate, now),
        }
    }
}

/// Gateway record of a transfer between prepare and commit.
#[derive(Debug, Clone, Copy)]
pub struct InflightTransfer {
    pub from: ZoneId,
    pub to: ZoneId,
    pub started_at: Instant,
}

/// All session state behind the gateway's one lock.
#[derive(Default)]
pub struct SessionTable {
    pub sessions: HashMap<SessionId, Session>,
    pub by_remote: HashMap<SocketAddr, SessionId>,
    /// At most one in-flight transfer per session.
    pub inflight: HashMap<SessionId, InflightTransfer>,
}

impl SessionTable {
    pub fn insert(&mut self, sess: Session) {
        self.by_remote.insert(sess.remote, sess.sid);
        self.sessions.insert(sess.sid, sess);
    }

    pub fn sid_by_remote(&self, remote: &SocketAddr) -> Option<SessionId> {
        self.by_remote.get(remote).copied()
    }

    pub fn get_mut(&mut self, sid: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    /// Removes a session and everything hanging off it. Returns the
    /// session so callers can notify its zone.
    pub fn remove(&mut self, sid: SessionId) -> Option<Session> {
        let sess = self.sessions.remove(&sid)?;
        self.by_remote.remove(&sess.remote);
        self.inflight.remove(&sid);
        Some(sess)
    }

    /// Sessions idle past `timeout`.
    pub fn idle_sids(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_heard) > timeout)
            .map(|(&sid, _)| sid)
            .collect()
    }

    /// In-flight transfers older than `timeout`.
    pub fn expired_transfers(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.inflight
            .iter()
            .filter(|(_, t)| now.duration_since(t.started_at) > timeout)
            .map(|(&sid, _)| sid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(n: u8, port: u16, now: Instant) -> Session {
        Session::new(
            SessionId([n; 16]),
            format!("127.0.0.1:{port}").parse().unwrap(),
            AccountId(n as u64),
            64 * 1024,
            8 * 1024,
            16 * 1024,
            now,
        )
    }

    #[test]
    fn remove_clears_every_index() {
        let now = Instant::now();
        let mut t = SessionTable::default();
        let s = session(1, 5000, now);
        let sid = s.sid;
        let remote = s.remote;
        t.insert(s);
        t.inflight.insert(
            sid,
            InflightTransfer {
                from: ZoneId(1),
                to: ZoneId(2),
                started_at: now,
            },
        );

        assert_eq!(t.sid_by_remote(&remote), Some(sid));
        let removed = t.remove(sid).unwrap();
        assert_eq!(removed.sid, sid);
        assert!(t.sid_by_remote(&remote).is_none());
        assert!(t.inflight.is_empty());
        assert!(t.remove(sid).is_none());
    }

    #[test]
    fn idle_and_expired_scans() {
        let now = Instant::now();
        let mut t = SessionTable::default();
        let mut old = session(1, 5000, now);
        old.last_heard = now - Duration::from_secs(60);
        let fresh = session(2, 5001, now);
        let old_sid = old.sid;
        t.insert(old);
        t.insert(fresh);

        let idle = t.idle_sids(now, Duration::from_secs(30));
        assert_eq!(idle, vec![old_sid]);

        t.inflight.insert(
            old_sid,
            InflightTransfer {
                from: ZoneId(1),
                to: ZoneId(2),
                started_at: now - Duration::from_secs(10),
            },
        );
        assert_eq!(
            t.expired_transfers(now, Duration::from_secs(5)),
            vec![old_sid]
        );
        assert!(t.expired_transfers(now, Duration::from_secs(30)).is_empty());
    }
}
