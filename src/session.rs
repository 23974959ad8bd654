use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::config::{RelayConfig, RelaySettings};
use crate::dns::DomainRecord;
use crate::engine::{Classified, Engine, Exchange};
use crate::error::SessionError;
use crate::relay::Relay;
use crate::tunnel::Tunnel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// At least one packet handled since the last idle tick.
    Active,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_read: u64,
    pub ignored: u64,
    pub malformed: u64,
    pub exchanges: u64,
    pub dropped_replies: u64,
    pub keepalives: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimers {
    pub keepalive_interval: Duration,
    pub receive_timeout: Duration,
}

impl From<&RelaySettings> for SessionTimers {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            keepalive_interval: settings.keepalive_interval(),
            receive_timeout: settings.receive_timeout(),
        }
    }
}

/// State of one established tunnel. Created fresh for every session and
/// discarded when the session ends.
#[derive(Debug)]
pub struct TunnelSession {
    pub last_send: Instant,
    pub last_receive: Instant,
    pub state: SessionState,
    pub stats: SessionStats,
    /// Resolved address -> domain, for diagnostics only.
    pub domains: HashMap<String, String>,
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelSession {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_send: now,
            last_receive: now,
            state: SessionState::Idle,
            stats: SessionStats::default(),
            domains: HashMap::new(),
        }
    }

    /// A session that completed at least one exchange counts as connected.
    pub fn was_connected(&self) -> bool {
        self.stats.exchanges > 0
    }

    fn next_deadline(&self, timers: &SessionTimers) -> Instant {
        (self.last_send + timers.keepalive_interval).min(self.last_receive + timers.receive_timeout)
    }

    fn remember(&mut self, records: Vec<DomainRecord>) {
        for record in records {
            debug!(address = %record.address, domain = %record.domain, "resolved");
            self.domains.insert(record.address, record.domain);
        }
    }
}

enum Event {
    Read(io::Result<usize>),
    Deadline,
}

/// Serve one tunnel session until it fails. Reads, relays and writes happen
/// strictly in sequence; a slow upstream stalls the whole loop.
pub async fn run_session<T: Tunnel, R: Relay>(
    tunnel: &mut T,
    engine: &Engine<R>,
    timers: &SessionTimers,
    session: &mut TunnelSession,
) -> Result<Infallible, SessionError> {
    let mut buf = vec![0u8; engine.max_packet_size()];

    loop {
        let deadline = session.next_deadline(timers);
        let event = tokio::select! {
            read = tunnel.recv(&mut buf) => Event::Read(read),
            _ = sleep_until(deadline) => Event::Deadline,
        };

        match event {
            Event::Read(Ok(0)) => {
                // nothing read: wait out the tick instead of spinning
                sleep_until(deadline).await;
                on_idle(tunnel, timers, session).await?;
            }
            Event::Read(Ok(n)) => {
                session.stats.packets_read += 1;
                handle_packet(tunnel, engine, session, &buf[..n]).await?;
            }
            Event::Read(Err(err)) => return Err(SessionError::Tunnel(err)),
            Event::Deadline => on_idle(tunnel, timers, session).await?,
        }
    }
}

async fn handle_packet<T: Tunnel, R: Relay>(
    tunnel: &mut T,
    engine: &Engine<R>,
    session: &mut TunnelSession,
    raw: &[u8],
) -> Result<(), SessionError> {
    let query = match engine.classify(raw) {
        Classified::Query(query) => query,
        Classified::Ignored(pkt) => {
            session.stats.ignored += 1;
            trace!(packet = %pkt, "ignoring non-dns packet");
            return Ok(());
        }
        Classified::Malformed(err) => {
            session.stats.malformed += 1;
            trace!(error = %err, len = raw.len(), "dropping undecodable packet");
            return Ok(());
        }
    };

    session.state = SessionState::Active;
    session.last_receive = Instant::now();

    match engine.exchange(&query).await? {
        Exchange::Reply { packet, records } => {
            tunnel.send(&packet).await.map_err(SessionError::Tunnel)?;
            session.last_send = Instant::now();
            session.stats.exchanges += 1;
            session.remember(records);
        }
        Exchange::Dropped(err) => {
            session.stats.dropped_replies += 1;
            debug!(error = %err, query = %query, "dropping reply");
        }
    }
    Ok(())
}

async fn on_idle<T: Tunnel>(
    tunnel: &mut T,
    timers: &SessionTimers,
    session: &mut TunnelSession,
) -> Result<(), SessionError> {
    session.state = SessionState::Idle;
    let now = Instant::now();

    if now.duration_since(session.last_send) >= timers.keepalive_interval {
        tunnel.send(&[]).await.map_err(SessionError::Tunnel)?;
        session.last_send = now;
        session.stats.keepalives += 1;
        trace!("sent keepalive");
    }

    if now.duration_since(session.last_receive) >= timers.receive_timeout {
        session.state = SessionState::Reconnecting;
        return Err(SessionError::SessionTimedOut(timers.receive_timeout));
    }
    Ok(())
}

/// Keep establishing sessions until `max_reconnect_attempts` consecutive
/// sessions end without a single completed exchange.
///
/// Settings are re-read from `config` before every attempt, so a reloaded
/// config applies from the next session on.
pub async fn supervise<C, T, M, R>(
    config: Arc<ArcSwap<RelayConfig>>,
    mut connect: C,
    mut make_relay: M,
) -> anyhow::Result<()>
where
    C: FnMut() -> io::Result<T>,
    T: Tunnel,
    M: FnMut(&RelaySettings) -> anyhow::Result<R>,
    R: Relay,
{
    let mut attempt: u32 = 0;

    loop {
        let cfg = config.load_full();
        let settings = &cfg.settings;
        if attempt >= settings.max_reconnect_attempts {
            error!(attempts = attempt, "giving up on tunnel");
            anyhow::bail!("tunnel not re-established after {} attempts", attempt);
        }

        let relay = match make_relay(settings) {
            Ok(relay) => relay,
            Err(err) => {
                warn!(attempt, error = %err, "cannot build relay from current settings");
                attempt += 1;
                sleep(settings.reconnect_wait()).await;
                continue;
            }
        };
        let engine = Engine::new(relay, settings);
        let timers = SessionTimers::from(settings);
        let mut session = TunnelSession::new();

        match connect() {
            Ok(mut tunnel) => {
                info!(attempt, upstream = %settings.upstream, "tunnel session established");
                let err = match run_session(&mut tunnel, &engine, &timers, &mut session).await {
                    Ok(never) => match never {},
                    Err(err) => err,
                };
                let stats = session.stats;
                warn!(
                    error = %err,
                    relay_failure = err.is_relay_failure(),
                    packets = stats.packets_read,
                    exchanges = stats.exchanges,
                    ignored = stats.ignored,
                    malformed = stats.malformed,
                    dropped_replies = stats.dropped_replies,
                    keepalives = stats.keepalives,
                    domains = session.domains.len(),
                    "tunnel session ended"
                );
            }
            Err(err) => {
                warn!(attempt, error = %err, "failed to establish tunnel");
            }
        }

        if session.was_connected() {
            attempt = 0;
        } else {
            attempt += 1;
        }
        sleep(settings.reconnect_wait()).await;
    }
}
