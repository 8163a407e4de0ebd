//! The daemon event loop.
//!
//! One task owns every interface and link state store. Socket pumps, send
//! timers, query connections and the snapshot server only talk to it
//! through [`Event`]s, so store updates never interleave.

use crate::config::Config;
use crate::interface::{self, ActiveLink, Interface, InterfaceAddrs, InterfaceMap};
use crate::protocol::{self, Absorbed, UNKNOWN_MAC};
use crate::query::{self, Answer, Query};
use crate::snapshot::{self, NeighborEntry};
use crate::store::Metric;
use crate::transport::{self, BindError, Binding};
use bytes::Bytes;
use pnet::datalink;
use rand::Rng;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVENT_QUEUE: usize = 1024;

#[derive(Debug)]
pub enum Event {
    Datagram {
        if_name: String,
        generation: u64,
        from: SocketAddr,
        payload: Bytes,
    },
    SendDue {
        if_name: String,
        generation: u64,
    },
    Query {
        query: Query,
        reply: oneshot::Sender<Answer>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<NeighborEntry>>,
    },
}

/// Cloneable access to the loop for read-only collaborators.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    events: mpsc::Sender<Event>,
}

impl DaemonHandle {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self { events }
    }

    pub async fn query(&self, query: Query) -> anyhow::Result<Answer> {
        let (reply, answer) = oneshot::channel();
        self.events
            .send(Event::Query { query, reply })
            .await
            .map_err(|_| anyhow::anyhow!("daemon loop has stopped"))?;
        Ok(answer.await?)
    }

    pub async fn snapshot(&self) -> anyhow::Result<Vec<NeighborEntry>> {
        let (reply, entries) = oneshot::channel();
        self.events
            .send(Event::Snapshot { reply })
            .await
            .map_err(|_| anyhow::anyhow!("daemon loop has stopped"))?;
        Ok(entries.await?)
    }
}

/// Delay until the next probe: `0.9 * interval` plus up to `0.2 * interval`
/// of jitter, so neighbors drift apart instead of colliding.
pub fn next_send_delay<R: Rng + ?Sized>(interval: Duration, rng: &mut R) -> Duration {
    let jitter: f64 = rng.gen_range(0.0..=0.2);
    Duration::try_from_secs_f64(interval.as_secs_f64() * (0.9 + jitter)).unwrap_or(interval)
}

fn spawn_send_timer(
    if_name: String,
    generation: u64,
    interval: Duration,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let due = Event::SendDue {
                if_name: if_name.clone(),
                generation,
            };
            if events.send(due).await.is_err() {
                break;
            }
            let delay = next_send_delay(interval, &mut rand::thread_rng());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    });
}

/// Binds what an active interface period needs: the probe socket, its
/// receive pump and the send timer.
fn bind_interface(
    if_name: &str,
    addrs: &InterfaceAddrs,
    generation: u64,
    config: &Config,
    events: &mpsc::Sender<Event>,
) -> Result<Binding, BindError> {
    let probe_addr = SocketAddrV4::new(addrs.broadcast, config.probe_port());
    let socket = Arc::new(transport::bind_broadcast(probe_addr)?);
    let cancel = CancellationToken::new();

    transport::spawn_receiver(
        socket.clone(),
        if_name.to_string(),
        generation,
        events.clone(),
        cancel.clone(),
    );
    spawn_send_timer(
        if_name.to_string(),
        generation,
        config.timing().interval(),
        events.clone(),
        cancel.clone(),
    );

    Ok(Binding::new(socket, SocketAddr::V4(probe_addr), cancel))
}

pub struct Daemon {
    config: Arc<Config>,
    interfaces: InterfaceMap<Binding>,
    /// Query listener on the local address of each active interface
    listeners: BTreeMap<String, query::Listener>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
}

impl Daemon {
    pub fn new(config: Arc<Config>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let interfaces = config
            .interfaces
            .iter()
            .map(|name| (name.clone(), Interface::new(name.clone())))
            .collect();
        Self {
            config,
            interfaces,
            listeners: BTreeMap::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle::new(self.events_tx.clone())
    }

    /// Runs until `shutdown` fires. Interfaces are rescanned once per window.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut rescan = tokio::time::interval(self.config.timing().window());
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = rescan.tick() => self.rescan(),
                Some(event) = self.events_rx.recv() => self.dispatch(event),
            }
        }
        info!("Stopping probes on all interfaces");
    }

    fn rescan(&mut self) {
        let system = datalink::interfaces();
        let timing = self.config.timing();
        let config = &self.config;
        let events = &self.events_tx;

        for iface in self.interfaces.values_mut() {
            let name = iface.name().to_string();
            let observed = interface::observe(&system, &name);
            iface.rescan(observed, timing, |addrs, generation| {
                bind_interface(&name, addrs, generation, config, events)
            });
        }
        self.sync_listeners();

        if self.config.verbosity >= 1 {
            self.dump_neighbors();
        }
    }

    /// One query listener on `local:port` per active interface, none for
    /// inactive ones. A listener whose address did not change is kept: a
    /// dropped listener frees its port only once its task has stopped.
    fn sync_listeners(&mut self) {
        let port = self.config.port;
        for (name, iface) in self.interfaces.iter_mut() {
            let Some(link) = iface.active_mut() else {
                self.listeners.remove(name);
                continue;
            };
            let addr = SocketAddr::from((link.addrs.local, port));
            if self
                .listeners
                .get(name)
                .is_some_and(|listener| listener.local_addr() == addr)
            {
                continue;
            }

            self.listeners.remove(name);
            match query::listen(addr, DaemonHandle::new(self.events_tx.clone())) {
                Ok(listener) => {
                    info!("{}: query server listening on {}", name, addr);
                    self.listeners.insert(name.clone(), listener);
                }
                Err(e) => warn!(
                    "{}: unable to listen for query connections at {}: {}",
                    name, addr, e
                ),
            }
        }
    }

    fn dump_neighbors(&mut self) {
        let active = self.interfaces.values().filter(|iface| iface.is_active()).count();
        debug!("{} of {} interfaces active", active, self.interfaces.len());

        let now = Instant::now();
        for iface in self.interfaces.values_mut() {
            let name = iface.name().to_string();
            let Some(store) = iface.store_mut() else {
                continue;
            };
            let view = store.view(now);
            debug!("{}: {:?}", name, view.neighbors(Metric::Probability));
            for (neighbor, twohop, p) in view.twohop_links() {
                debug!("{}: {} -> {}: {}", name, neighbor, twohop, p);
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Datagram {
                if_name,
                generation,
                from,
                payload,
            } => self.on_datagram(&if_name, generation, from, &payload),
            Event::SendDue {
                if_name,
                generation,
            } => self.on_send_due(&if_name, generation),
            Event::Query { query, reply } => {
                let answer = query::answer(&query, &mut self.interfaces, Instant::now());
                let _ = reply.send(answer);
            }
            Event::Snapshot { reply } => {
                let entries = snapshot::collect(&mut self.interfaces, Instant::now());
                let _ = reply.send(entries);
            }
        }
    }

    /// The active period an event was issued for, if it is still current.
    fn current(&mut self, if_name: &str, generation: u64) -> Option<&mut ActiveLink<Binding>> {
        let link = self.interfaces.get_mut(if_name)?.active_mut()?;
        (link.generation == generation).then_some(link)
    }

    fn on_datagram(&mut self, if_name: &str, generation: u64, from: SocketAddr, payload: &[u8]) {
        let diagnostics = self.config.probe_diagnostics();
        let Some(link) = self.current(if_name, generation) else {
            trace!("{}: dropping probe for a torn down interface", if_name);
            return;
        };
        let IpAddr::V4(sender) = from.ip() else {
            return;
        };

        let now = Instant::now();
        match protocol::absorb_probe(&mut link.store, sender, payload, now) {
            Ok(Absorbed::Recorded) if diagnostics => {
                debug!("{}", link.store.view(now).debug_summary(sender));
            }
            Ok(_) => {}
            Err(e) => warn!("{}: dropping probe from {}: {}", if_name, sender, e),
        }
    }

    fn on_send_due(&mut self, if_name: &str, generation: u64) {
        let diagnostics = self.config.probe_diagnostics();
        let Some(link) = self.current(if_name, generation) else {
            return;
        };

        let mac = interface::hardware_address(if_name).unwrap_or_else(|| UNKNOWN_MAC.to_string());
        let datagram = match protocol::build_probe(&mut link.store, &mac, Instant::now()) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("{}: unable to build probe: {}", if_name, e);
                return;
            }
        };
        if diagnostics {
            debug!("{}: sending probe to {}", if_name, link.addrs.broadcast);
        }
        if let Err(e) = link.binding.send(&datagram) {
            warn!("{}: probe not sent: {}", if_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Observation, Transition};
    use crate::protocol::ProbePayload;
    use crate::store::{ProbeCounts, TwoHopTable};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::net::Ipv4Addr;
    use tokio::net::{TcpStream, UdpSocket};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
    const NEIGHBOR: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            interfaces: vec!["test0".into()],
            ..Config::default()
        })
    }

    /// Activates `test0` on a loopback socket that sends to itself.
    async fn activate(daemon: &mut Daemon) -> Arc<UdpSocket> {
        let socket = Arc::new(UdpSocket::bind((LOCAL, 0)).await.unwrap());
        let target = socket.local_addr().unwrap();
        let timing = daemon.config.timing();
        let observed = Observation::Up(InterfaceAddrs {
            local: LOCAL,
            broadcast: Ipv4Addr::new(127, 255, 255, 255),
        });
        let iface = daemon.interfaces.get_mut("test0").unwrap();
        let bound = socket.clone();
        iface.rescan(observed, timing, move |_, _| {
            Ok(Binding::new(bound, target, CancellationToken::new()))
        });
        socket
    }

    fn probe_from_neighbor() -> Bytes {
        let mut neighbors = TwoHopTable::new();
        neighbors.insert(
            LOCAL,
            ProbeCounts {
                received: 10,
                reported: 0,
            },
        );
        ProbePayload {
            mac: "02:00:00:00:00:02".into(),
            neighbors,
        }
        .encode()
        .unwrap()
    }

    fn datagram(generation: u64, payload: Bytes) -> Event {
        Event::Datagram {
            if_name: "test0".into(),
            generation,
            from: SocketAddr::from((NEIGHBOR, 9158)),
            payload,
        }
    }

    #[test]
    fn test_send_delay_stays_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let interval = Duration::from_secs(1);
        let mut total = Duration::ZERO;
        for _ in 0..1000 {
            let delay = next_send_delay(interval, &mut rng);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
            total += delay;
        }
        let mean = total / 1000;
        assert!(mean > Duration::from_millis(970) && mean < Duration::from_millis(1030));
    }

    #[test]
    fn test_send_delay_of_huge_interval_does_not_overflow() {
        let mut rng = StdRng::seed_from_u64(1);
        let interval = Duration::from_secs(u64::MAX);
        assert!(next_send_delay(interval, &mut rng) >= interval.mul_f64(0.5));
    }

    #[tokio::test]
    async fn test_datagram_for_current_generation_is_recorded() {
        let mut daemon = Daemon::new(test_config());
        activate(&mut daemon).await;

        daemon.dispatch(datagram(1, probe_from_neighbor()));

        let store = daemon.interfaces.get_mut("test0").unwrap().store_mut().unwrap();
        let view = store.view(Instant::now());
        assert_eq!(view.forward_ratio(NEIGHBOR), 1.0);
        assert_eq!(view.lookup_mac(NEIGHBOR), Some("02:00:00:00:00:02"));
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let mut daemon = Daemon::new(test_config());
        activate(&mut daemon).await;

        daemon.dispatch(datagram(0, probe_from_neighbor()));
        daemon.dispatch(Event::SendDue {
            if_name: "unknown0".into(),
            generation: 1,
        });

        let store = daemon.interfaces.get_mut("test0").unwrap().store_mut().unwrap();
        assert!(store.view(Instant::now()).probe_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_datagram_does_not_stop_the_loop() {
        let mut daemon = Daemon::new(test_config());
        activate(&mut daemon).await;

        daemon.dispatch(datagram(1, Bytes::from_static(b"\x80\x04junk")));
        daemon.dispatch(datagram(1, probe_from_neighbor()));

        let store = daemon.interfaces.get_mut("test0").unwrap().store_mut().unwrap();
        assert_eq!(store.view(Instant::now()).probe_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_send_due_broadcasts_snapshot() {
        let mut daemon = Daemon::new(test_config());
        let socket = activate(&mut daemon).await;
        daemon.dispatch(datagram(1, probe_from_neighbor()));

        daemon.dispatch(Event::SendDue {
            if_name: "test0".into(),
            generation: 1,
        });

        let mut buf = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let probe = ProbePayload::decode(&buf[..n]).unwrap();
        assert_eq!(
            probe.neighbors[&NEIGHBOR],
            ProbeCounts {
                received: 1,
                reported: 10
            }
        );
    }

    #[tokio::test]
    async fn test_netmask_change_keeps_query_listener() {
        let port = {
            let free = std::net::TcpListener::bind((LOCAL, 0)).unwrap();
            free.local_addr().unwrap().port()
        };
        let mut daemon = Daemon::new(Arc::new(Config {
            interfaces: vec!["test0".into()],
            port,
            ..Config::default()
        }));
        let socket = activate(&mut daemon).await;
        daemon.sync_listeners();
        let addr = SocketAddr::from((LOCAL, port));
        assert_eq!(daemon.listeners["test0"].local_addr(), addr);

        // same local address, new broadcast address
        let timing = daemon.config.timing();
        let target = socket.local_addr().unwrap();
        let observed = Observation::Up(InterfaceAddrs {
            local: LOCAL,
            broadcast: Ipv4Addr::new(127, 0, 255, 255),
        });
        let transition = daemon.interfaces.get_mut("test0").unwrap().rescan(
            observed,
            timing,
            move |_, _| Ok(Binding::new(socket, target, CancellationToken::new())),
        );
        assert!(matches!(transition, Transition::Reconfigured));
        daemon.sync_listeners();
        assert_eq!(daemon.listeners["test0"].local_addr(), addr);
        TcpStream::connect(addr).await.unwrap();

        daemon
            .interfaces
            .get_mut("test0")
            .unwrap()
            .rescan(Observation::Absent, timing, |_, _| panic!("must not bind"));
        daemon.sync_listeners();
        assert!(daemon.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_queries_are_answered_by_the_loop() {
        let daemon = Daemon::new(test_config());
        let handle = daemon.handle();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(daemon.run(shutdown.clone()));

        // no interface is active on this host under the name test0
        let answer = handle.query(Query::Neighbors(None)).await.unwrap();
        assert_eq!(answer, Answer::Lines(Vec::new()));
        assert!(handle.snapshot().await.unwrap().is_empty());

        shutdown.cancel();
        running.await.unwrap();
    }
}
