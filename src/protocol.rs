use crate::store::{LinkStore, TwoHopTable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Instant;
use thiserror::Error;

/// Largest probe we accept; one UDP datagram.
pub const MAX_PROBE_SIZE: usize = 65_507;

/// Sent when the interface hardware address cannot be determined.
pub const UNKNOWN_MAC: &str = "00:00:00:00:00:00";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed probe: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Probe too large ({0} bytes)")]
    TooLarge(usize),
}

/// One broadcast probe: the sender's MAC and its view of its neighbors.
///
/// Encoded as a JSON object. Unknown fields are ignored so newer nodes can
/// add to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbePayload {
    pub mac: String,
    #[serde(default)]
    pub neighbors: TwoHopTable,
}

impl ProbePayload {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let buf = serde_json::to_vec(self)?;
        if buf.len() > MAX_PROBE_SIZE {
            return Err(ProtocolError::TooLarge(buf.len()));
        }
        Ok(Bytes::from(buf))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() > MAX_PROBE_SIZE {
            return Err(ProtocolError::TooLarge(buf.len()));
        }
        Ok(serde_json::from_slice(buf)?)
    }
}

/// Builds the next outgoing probe from live store data.
pub fn build_probe(store: &mut LinkStore, mac: &str, now: Instant) -> Result<Bytes, ProtocolError> {
    let payload = ProbePayload {
        mac: mac.to_string(),
        neighbors: store.view(now).probe_snapshot(),
    };
    payload.encode()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorbed {
    /// Our own broadcast looped back
    OwnEcho,
    Recorded,
}

/// Records an incoming probe from `sender` into the store.
///
/// A malformed datagram leaves the store untouched.
pub fn absorb_probe(
    store: &mut LinkStore,
    sender: Ipv4Addr,
    datagram: &[u8],
    now: Instant,
) -> Result<Absorbed, ProtocolError> {
    if sender == store.self_addr() {
        return Ok(Absorbed::OwnEcho);
    }
    let payload = ProbePayload::decode(datagram)?;
    store.record_probe(sender, payload.mac, payload.neighbors, now);
    Ok(Absorbed::Recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeTiming;
    use crate::store::{Metric, ProbeCounts};

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn store(addr: Ipv4Addr) -> LinkStore {
        LinkStore::new(
            addr,
            ProbeTiming {
                window_secs: 10,
                interval_secs: 1,
            },
        )
    }

    #[test]
    fn test_wire_format_is_self_describing() {
        let mut neighbors = TwoHopTable::new();
        neighbors.insert(
            B,
            ProbeCounts {
                received: 7,
                reported: 9,
            },
        );
        let payload = ProbePayload {
            mac: "02:00:00:00:00:01".into(),
            neighbors,
        };
        let json: serde_json::Value = serde_json::from_slice(&payload.encode().unwrap()).unwrap();
        assert_eq!(json["mac"], "02:00:00:00:00:01");
        assert_eq!(json["neighbors"]["10.0.0.2"]["received"], 7);
        assert_eq!(json["neighbors"]["10.0.0.2"]["reported"], 9);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let raw = br#"{"mac":"aa","neighbors":{},"version":2,"extra":[1,2]}"#;
        let payload = ProbePayload::decode(raw).unwrap();
        assert_eq!(payload.mac, "aa");
        assert!(payload.neighbors.is_empty());
    }

    #[test]
    fn test_malformed_probe_leaves_store_untouched() {
        let mut s = store(A);
        let now = Instant::now();
        let cases: [&[u8]; 4] = [
            b"\x80\x03garbage",
            b"",
            br#"{"neighbors":{}}"#,
            br#"{"mac":"aa","neighbors":{"not-an-ip":{"received":1,"reported":1}}}"#,
        ];
        for garbage in cases {
            assert!(absorb_probe(&mut s, B, garbage, now).is_err());
        }
        assert!(s.view(now).probe_snapshot().is_empty());
        assert_eq!(s.lookup_mac(B), None);
    }

    #[test]
    fn test_own_echo_discarded() {
        let mut s = store(A);
        let now = Instant::now();
        let probe = build_probe(&mut s, "02:00:00:00:00:01", now).unwrap();
        assert_eq!(absorb_probe(&mut s, A, &probe, now).unwrap(), Absorbed::OwnEcho);
        assert!(s.view(now).probe_snapshot().is_empty());
    }

    #[test]
    fn test_exchange_between_two_nodes() {
        let mut a = store(A);
        let mut b = store(B);
        let base = Instant::now();

        // ten rounds, both directions lossless
        for i in 0..10 {
            let now = base + std::time::Duration::from_millis(1000 * i);
            let from_a = build_probe(&mut a, "02:00:00:00:00:01", now).unwrap();
            absorb_probe(&mut b, A, &from_a, now).unwrap();
            let from_b = build_probe(&mut b, "02:00:00:00:00:02", now).unwrap();
            absorb_probe(&mut a, B, &from_b, now).unwrap();
        }

        let now = base + std::time::Duration::from_millis(9500);
        let view = a.view(now);
        assert_eq!(view.reverse_ratio(B), 1.0);
        // B's last probe carried 10 probes received from A
        assert_eq!(view.forward_ratio(B), 1.0);
        assert_eq!(view.neighbors(Metric::Etx)[&B], 1.0);
        assert_eq!(view.lookup_mac(B), Some("02:00:00:00:00:02"));
    }

    #[test]
    fn test_oversized_probe_rejected() {
        let big = vec![b' '; MAX_PROBE_SIZE + 1];
        assert!(matches!(
            ProbePayload::decode(&big),
            Err(ProtocolError::TooLarge(_))
        ));
    }
}
