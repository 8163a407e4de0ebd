//! System interface discovery and the per-interface lifecycle.
//!
//! An interface is either inactive or active; only an active interface owns
//! a link state store and the bound transport resources.

use crate::config::ProbeTiming;
use crate::store::LinkStore;
use crate::transport::BindError;
use pnet::datalink;
use pnet::ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Addresses a probed interface is bound with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddrs {
    pub local: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

/// What a system scan saw for one interface name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Absent,
    /// Present but down, or without an IPv4 broadcast network
    NoAddress,
    Up(InterfaceAddrs),
}

/// Looks up `name` among the system interfaces.
pub fn observe(system: &[datalink::NetworkInterface], name: &str) -> Observation {
    match system.iter().find(|iface| iface.name == name) {
        Some(iface) => classify(iface.is_up(), &iface.ips),
        None => Observation::Absent,
    }
}

/// Picks the first IPv4 network that has a broadcast address.
fn classify(up: bool, ips: &[IpNetwork]) -> Observation {
    if !up {
        return Observation::NoAddress;
    }
    ips.iter()
        .find_map(|network| match network {
            // /31 and /32 have no broadcast address
            IpNetwork::V4(v4) if v4.prefix() <= 30 && !v4.ip().is_loopback() => {
                Some(InterfaceAddrs {
                    local: v4.ip(),
                    broadcast: v4.broadcast(),
                })
            }
            _ => None,
        })
        .map_or(Observation::NoAddress, Observation::Up)
}

/// Names the system knows about right now.
pub fn exists(name: &str) -> bool {
    datalink::interfaces().iter().any(|iface| iface.name == name)
}

/// Current link-layer address of `name`, e.g. `02:00:00:00:00:01`.
pub fn hardware_address(name: &str) -> Option<String> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| iface.mac)
        .map(|mac| mac.to_string())
}

/// First usable IPv4 address of `name`, used for management listeners.
pub fn ipv4_address(name: &str) -> Option<Ipv4Addr> {
    match observe(&datalink::interfaces(), name) {
        Observation::Up(addrs) => Some(addrs.local),
        _ => None,
    }
}

/// Resources and statistics of one active period.
#[derive(Debug)]
pub struct ActiveLink<B> {
    pub addrs: InterfaceAddrs,
    pub generation: u64,
    pub store: LinkStore,
    pub binding: B,
}

#[derive(Debug)]
pub enum InterfaceState<B> {
    Inactive,
    Active(ActiveLink<B>),
}

#[derive(Debug)]
pub enum Transition {
    /// Still absent
    Idle,
    /// Present without a usable address
    Unusable,
    Activated,
    Unchanged,
    Deactivated,
    /// Broadcast address changed and the interface came back up
    Reconfigured,
    BindFailed(BindError),
}

#[derive(Debug)]
pub struct Interface<B> {
    name: String,
    generation: u64,
    state: InterfaceState<B>,
}

pub type InterfaceMap<B> = BTreeMap<String, Interface<B>>;

impl<B> Interface<B> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: 0,
            state: InterfaceState::Inactive,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, InterfaceState::Active(_))
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveLink<B>> {
        match &mut self.state {
            InterfaceState::Active(link) => Some(link),
            InterfaceState::Inactive => None,
        }
    }

    /// Store of the current active period, if any.
    pub fn store_mut(&mut self) -> Option<&mut LinkStore> {
        self.active_mut().map(|link| &mut link.store)
    }

    /// Applies one scan result. `bind` is called with the new addresses and
    /// generation whenever the interface has to be (re)activated.
    pub fn rescan<F>(&mut self, observed: Observation, timing: ProbeTiming, bind: F) -> Transition
    where
        F: FnOnce(&InterfaceAddrs, u64) -> Result<B, BindError>,
    {
        let mut reconfigured = false;

        if let InterfaceState::Active(link) = &self.state {
            match observed {
                Observation::Up(addrs) if addrs.broadcast == link.addrs.broadcast => {
                    return Transition::Unchanged;
                }
                Observation::Up(_) => {
                    info!("{}: interface has been reconfigured", self.name);
                    reconfigured = true;
                }
                Observation::Absent | Observation::NoAddress => {
                    info!("{}: interface went away, stopping probes", self.name);
                }
            }
            // drops store and binding of the old period
            self.state = InterfaceState::Inactive;
            if !reconfigured {
                return Transition::Deactivated;
            }
        }

        let addrs = match observed {
            Observation::Up(addrs) => addrs,
            Observation::Absent => {
                debug!("{}: interface not configured", self.name);
                return Transition::Idle;
            }
            Observation::NoAddress => {
                warn!(
                    "{}: unable to determine IP address, although the interface seems to be up",
                    self.name
                );
                return Transition::Unusable;
            }
        };

        self.generation += 1;
        match bind(&addrs, self.generation) {
            Ok(binding) => {
                info!(
                    "{}: listening for probes at {} (local {})",
                    self.name, addrs.broadcast, addrs.local
                );
                self.state = InterfaceState::Active(ActiveLink {
                    addrs,
                    generation: self.generation,
                    store: LinkStore::new(addrs.local, timing),
                    binding,
                });
                if reconfigured {
                    Transition::Reconfigured
                } else {
                    Transition::Activated
                }
            }
            Err(e) => {
                warn!(
                    "{}: {}. Maybe another interface uses the same broadcast address",
                    self.name, e
                );
                Transition::BindFailed(e)
            }
        }
    }
}
