//! Line-oriented query server.
//!
//! A client sends one command line and receives zero or more result lines;
//! the server then closes the connection. Commands:
//!
//! - `NEIGHBORS [interface]`: `interface:neighbor:quality` per neighbor
//! - `MAC`: `interface|mac|quality` per neighbor with a known MAC
//! - `CHAFT [min_quality]`: `neighbor:channel` per neighbor at or above
//!   `min_quality`
//! - `QUALITY neighbor`: `neighbor:probability`
//! - `ETX neighbor`: `neighbor:etx`
//!
//! Anything else gets `INVALID SYNTAX`, and so do `QUALITY` and `ETX`
//! when the neighbor is missing or not an IPv4 address. A well-formed
//! neighbor we have no link to gets an empty response.

use crate::interface::InterfaceMap;
use crate::radio;
use crate::scheduler::DaemonHandle;
use crate::store::Metric;
use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ERR_SYNTAX: &str = "INVALID SYNTAX";

const MAX_REQUEST: u64 = 1024;

#[derive(Error, Debug, PartialEq)]
pub enum QueryError {
    #[error("empty request")]
    Empty,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("{0} requires a neighbor address")]
    MissingArgument(&'static str),
    #[error("invalid neighbor address {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Neighbors(Option<String>),
    Mac,
    Chaft(f64),
    Quality(Ipv4Addr),
    Etx(Ipv4Addr),
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let command = words.next().ok_or(QueryError::Empty)?.to_uppercase();
        let arg = words.next();

        match command.as_str() {
            "NEIGHBORS" => Ok(Query::Neighbors(arg.map(str::to_string))),
            "MAC" => Ok(Query::Mac),
            "CHAFT" => {
                let min = arg
                    .and_then(|a| a.parse::<f64>().ok())
                    .filter(|q| (0.0..=1.0).contains(q))
                    .unwrap_or(0.0);
                Ok(Query::Chaft(min))
            }
            "QUALITY" => neighbor_arg("QUALITY", arg).map(Query::Quality),
            "ETX" => neighbor_arg("ETX", arg).map(Query::Etx),
            _ => Err(QueryError::UnknownCommand(command)),
        }
    }
}

fn neighbor_arg(command: &'static str, arg: Option<&str>) -> Result<Ipv4Addr, QueryError> {
    let arg = arg.ok_or(QueryError::MissingArgument(command))?;
    arg.parse()
        .map_err(|_| QueryError::InvalidAddress(arg.to_string()))
}

/// A neighbor whose channel still has to be read from the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCandidate {
    pub if_name: String,
    pub neighbor: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Lines(Vec<String>),
    Channels(Vec<ChannelCandidate>),
}

/// Evaluates `query` against the interface stores. Interfaces without a
/// store contribute nothing.
pub fn answer<B>(query: &Query, interfaces: &mut InterfaceMap<B>, now: Instant) -> Answer {
    let mut lines = Vec::new();

    match query {
        Query::Neighbors(Some(if_name)) => {
            if let Some(store) = interfaces.get_mut(if_name).and_then(|i| i.store_mut()) {
                for (neighbor, quality) in store.view(now).neighbors(Metric::Probability) {
                    lines.push(format!("{}:{}:{}", if_name, neighbor, quality));
                }
            }
        }
        Query::Neighbors(None) => {
            for (if_name, iface) in interfaces.iter_mut() {
                let Some(store) = iface.store_mut() else { continue };
                for (neighbor, quality) in store.view(now).neighbors(Metric::Probability) {
                    lines.push(format!("{}:{}:{}", if_name, neighbor, quality));
                }
            }
        }
        Query::Mac => {
            for (if_name, iface) in interfaces.iter_mut() {
                let Some(store) = iface.store_mut() else { continue };
                let view = store.view(now);
                for (neighbor, quality) in view.neighbors(Metric::Probability) {
                    match view.lookup_mac(neighbor) {
                        Some(mac) => lines.push(format!("{}|{}|{}", if_name, mac, quality)),
                        None => error!("Unable to determine MAC address for {}", neighbor),
                    }
                }
            }
        }
        Query::Chaft(min_quality) => {
            let mut candidates = Vec::new();
            for (if_name, iface) in interfaces.iter_mut() {
                let Some(store) = iface.store_mut() else { continue };
                for (neighbor, quality) in store.view(now).neighbors(Metric::Probability) {
                    if quality >= *min_quality {
                        candidates.push(ChannelCandidate {
                            if_name: if_name.clone(),
                            neighbor,
                        });
                    }
                }
            }
            return Answer::Channels(candidates);
        }
        Query::Quality(neighbor) | Query::Etx(neighbor) => {
            let neighbor = *neighbor;
            for iface in interfaces.values_mut() {
                let Some(store) = iface.store_mut() else { continue };
                let view = store.view(now);
                if !view.neighbors(Metric::Probability).contains_key(&neighbor) {
                    continue;
                }
                let value = match query {
                    Query::Etx(_) => view.etx(neighbor),
                    _ => view.transmission_probability(neighbor),
                };
                lines.push(format!("{}:{}", neighbor, value));
            }
        }
    }

    Answer::Lines(lines)
}

/// Turns channel candidates into `neighbor:channel` lines.
async fn resolve_channels(candidates: Vec<ChannelCandidate>) -> Vec<String> {
    let mut channels: BTreeMap<String, Option<u32>> = BTreeMap::new();
    let mut lines = Vec::new();

    for candidate in candidates {
        if !channels.contains_key(&candidate.if_name) {
            let channel = radio::channel(&candidate.if_name).await;
            if channel.is_none() {
                warn!("{}: unable to determine channel", candidate.if_name);
            }
            channels.insert(candidate.if_name.clone(), channel);
        }
        if let Some(Some(channel)) = channels.get(&candidate.if_name) {
            lines.push(format!("{}:{}", candidate.neighbor, channel));
        }
    }
    lines
}

/// A running query listener. Dropping it stops accepting connections.
#[derive(Debug)]
pub struct Listener {
    local: SocketAddr,
    cancel: CancellationToken,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Accepts query connections on `addr` until the returned [`Listener`] is
/// dropped.
///
/// Binds synchronously so the caller learns about address conflicts.
pub fn listen(addr: SocketAddr, handle: DaemonHandle) -> io::Result<Listener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    let local = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let stop = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        info!("Handling query connection from {}", peer);
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handle).await {
                                warn!("Query connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("Query accept error on {}: {}", local, e),
                },
            }
        }
        debug!("Query listener on {} stopped", local);
    });

    Ok(Listener { local, cancel })
}

async fn serve_connection(stream: TcpStream, handle: DaemonHandle) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut request = String::new();
    BufReader::new(reader.take(MAX_REQUEST))
        .read_line(&mut request)
        .await?;

    let lines = match request.parse::<Query>() {
        Ok(query) => match handle.query(query).await? {
            Answer::Lines(lines) => lines,
            Answer::Channels(candidates) => resolve_channels(candidates).await,
        },
        Err(e) => {
            debug!("Rejecting query {:?}: {}", request.trim(), e);
            vec![ERR_SYNTAX.to_string()]
        }
    };

    for line in lines {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    writer.shutdown().await?;
    Ok(())
}
