//! Networks channel decoding.
//!
//! The scan result is a JSON array of `{ssid, rssi}` objects. The peripheral
//! either sends it as one notification ([`ReassemblyMode::Direct`]) or, when
//! it does not fit one notification, as a framed sequence
//! ([`ReassemblyMode::Framed`]):
//!
//! ```text
//! [0x11][total: u16 BE]                 FrameStart
//! [0x12][index: u16 BE][payload...]     FrameChunk
//! ```
//!
//! Chunks may arrive in any order. A malformed stream is discarded and
//! logged, never reported upward: a rescan supersedes it.

use std::collections::BTreeMap;

use crate::chunk::FrameError;

pub const HEADER_START: u8 = 0x11;
pub const HEADER_CHUNK: u8 = 0x12;

/// One network from a scan result.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub ssid: String,
    pub rssi: i32,
}

#[derive(thiserror::Error, Debug)]
pub enum ReassemblyError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not a networks list: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a complete networks payload.
pub fn decode_networks(payload: &[u8]) -> Result<Vec<Network>, ReassemblyError> {
    let text = std::str::from_utf8(payload)?;
    Ok(serde_json::from_str(text)?)
}

/// Which transport shape the peripheral uses for the networks channel.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReassemblyMode {
    #[default]
    Direct,
    Framed,
}

impl std::str::FromStr for ReassemblyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ReassemblyMode::Direct),
            "framed" => Ok(ReassemblyMode::Framed),
            other => Err(format!("unknown reassembly mode {other:?} (direct|framed)")),
        }
    }
}

impl std::fmt::Display for ReassemblyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReassemblyMode::Direct => f.write_str("direct"),
            ReassemblyMode::Framed => f.write_str("framed"),
        }
    }
}

/// Header-decoded inbound frame of the framed variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Start { total: u16 },
    Chunk { index: u16, payload: Vec<u8> },
}

impl InboundFrame {
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let (&kind, rest) = data.split_first().ok_or(FrameError::Empty)?;
        if rest.len() < 2 {
            return Err(FrameError::Truncated {
                need: 3,
                got: data.len(),
            });
        }
        let value = u16::from_be_bytes([rest[0], rest[1]]);
        match kind {
            HEADER_START => Ok(InboundFrame::Start { total: value }),
            HEADER_CHUNK => Ok(InboundFrame::Chunk {
                index: value,
                payload: rest[2..].to_vec(),
            }),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            InboundFrame::Start { total } => {
                let mut buf = Vec::with_capacity(3);
                buf.push(HEADER_START);
                buf.extend_from_slice(&total.to_be_bytes());
                buf
            }
            InboundFrame::Chunk { index, payload } => {
                let mut buf = Vec::with_capacity(3 + payload.len());
                buf.push(HEADER_CHUNK);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }
}

/// Frame a payload the way the peripheral does for the framed variant.
pub fn encode_framed(payload: &[u8], chunk_len: usize) -> Vec<InboundFrame> {
    let pieces: Vec<&[u8]> = payload.chunks(chunk_len.max(1)).collect();
    let mut frames = Vec::with_capacity(pieces.len() + 1);
    frames.push(InboundFrame::Start {
        total: pieces.len() as u16,
    });
    for (index, piece) in pieces.into_iter().enumerate() {
        frames.push(InboundFrame::Chunk {
            index: index as u16,
            payload: piece.to_vec(),
        });
    }
    frames
}

#[derive(Debug)]
struct PendingReassembly {
    total: u16,
    received: BTreeMap<u16, Vec<u8>>,
}

/// Accumulates framed chunks for one channel.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    pending: Option<PendingReassembly>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Parse and push one raw notification.
    pub fn feed(&mut self, raw: &[u8]) -> Option<Vec<Network>> {
        match InboundFrame::parse(raw) {
            Ok(frame) => self.push(frame),
            Err(e) => {
                log::warn!("discarding networks frame: {e}");
                self.reset();
                None
            }
        }
    }

    /// Push one frame; returns the decoded list once the set is complete.
    pub fn push(&mut self, frame: InboundFrame) -> Option<Vec<Network>> {
        match frame {
            InboundFrame::Start { total } => {
                if self.pending.is_some() {
                    log::debug!("new networks FrameStart replaces pending reassembly");
                }
                self.pending = (total > 0).then(|| PendingReassembly {
                    total,
                    received: BTreeMap::new(),
                });
                None
            }
            InboundFrame::Chunk { index, payload } => {
                let Some(pending) = self.pending.as_mut() else {
                    log::warn!("networks chunk {index} without FrameStart, discarding");
                    return None;
                };
                if index >= pending.total {
                    log::warn!(
                        "networks chunk {index} out of range (total {}), discarding",
                        pending.total
                    );
                    self.reset();
                    return None;
                }
                pending.received.insert(index, payload);
                if pending.received.len() < pending.total as usize {
                    return None;
                }
                self.complete()
            }
        }
    }

    fn complete(&mut self) -> Option<Vec<Network>> {
        let pending = self.pending.take()?;
        let mut payload = Vec::new();
        for index in 0..pending.total {
            match pending.received.get(&index) {
                Some(bytes) => payload.extend_from_slice(bytes),
                None => {
                    log::warn!("networks chunk {index} missing at completion, discarding");
                    return None;
                }
            }
        }
        match decode_networks(&payload) {
            Ok(networks) => Some(networks),
            Err(e) => {
                log::warn!("discarding reassembled networks payload: {e}");
                None
            }
        }
    }
}

/// Decoder for the networks channel in the mode chosen at connect time.
#[derive(Debug, Default)]
pub struct NetworksDecoder {
    mode: ReassemblyMode,
    reassembler: FrameReassembler,
}

impl NetworksDecoder {
    pub fn new(mode: ReassemblyMode) -> Self {
        Self {
            mode,
            reassembler: FrameReassembler::new(),
        }
    }

    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    /// Forget any partial state, e.g. after the link was re-established.
    pub fn reset(&mut self) {
        self.reassembler.reset();
    }

    pub fn decode(&mut self, raw: &[u8]) -> Option<Vec<Network>> {
        match self.mode {
            ReassemblyMode::Direct => match decode_networks(raw) {
                Ok(networks) => Some(networks),
                Err(e) => {
                    log::warn!("discarding networks notification: {e}");
                    None
                }
            },
            ReassemblyMode::Framed => self.reassembler.feed(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SCAN: &str = r#"[{"ssid": "Home", "rssi": -40}, {"ssid": "Café Wi-Fi", "rssi": -71}, {"ssid": "Neighbour", "rssi": -88}]"#;

    fn scan() -> Vec<Network> {
        decode_networks(SCAN.as_bytes()).unwrap()
    }

    #[test]
    fn decodes_descriptors() {
        let networks = scan();
        assert_eq!(networks.len(), 3);
        assert_eq!(
            networks[1],
            Network {
                ssid: "Café Wi-Fi".to_string(),
                rssi: -71
            }
        );
    }

    #[test]
    fn in_order_reassembly() {
        let mut r = FrameReassembler::new();
        let frames = encode_framed(SCAN.as_bytes(), 17);
        let last = frames.len() - 1;
        for (i, frame) in frames.into_iter().enumerate() {
            let out = r.feed(&frame.to_bytes());
            if i < last {
                assert!(out.is_none());
            } else {
                assert_eq!(out, Some(scan()));
            }
        }
        assert!(!r.is_pending());
    }

    #[test]
    fn chunk_without_start_is_discarded() {
        let mut r = FrameReassembler::new();
        let chunk = InboundFrame::Chunk {
            index: 0,
            payload: b"[]".to_vec(),
        };
        assert_eq!(r.push(chunk), None);
        assert!(!r.is_pending());
    }

    #[test]
    fn second_start_discards_first() {
        let mut r = FrameReassembler::new();
        r.push(InboundFrame::Start { total: 2 });
        r.push(InboundFrame::Chunk {
            index: 0,
            payload: b"garbage".to_vec(),
        });

        let payload = br#"[{"ssid":"A","rssi":-1}]"#;
        let mut out = None;
        for frame in encode_framed(payload, 8) {
            out = r.push(frame);
        }
        assert_eq!(
            out,
            Some(vec![Network {
                ssid: "A".to_string(),
                rssi: -1
            }])
        );
    }

    #[test]
    fn zero_total_resets() {
        let mut r = FrameReassembler::new();
        r.push(InboundFrame::Start { total: 3 });
        r.push(InboundFrame::Start { total: 0 });
        assert!(!r.is_pending());
    }

    #[test]
    fn out_of_range_index_resets() {
        let mut r = FrameReassembler::new();
        r.push(InboundFrame::Start { total: 2 });
        let out = r.push(InboundFrame::Chunk {
            index: 2,
            payload: vec![],
        });
        assert_eq!(out, None);
        assert!(!r.is_pending());
    }

    #[test]
    fn duplicate_index_keeps_latest() {
        let mut r = FrameReassembler::new();
        r.push(InboundFrame::Start { total: 2 });
        r.push(InboundFrame::Chunk {
            index: 0,
            payload: b"[{\"ssid\":\"X\"".to_vec(),
        });
        r.push(InboundFrame::Chunk {
            index: 0,
            payload: b"[{\"ssid\":\"Y\"".to_vec(),
        });
        let out = r.push(InboundFrame::Chunk {
            index: 1,
            payload: b",\"rssi\":-5}]".to_vec(),
        });
        assert_eq!(
            out,
            Some(vec![Network {
                ssid: "Y".to_string(),
                rssi: -5
            }])
        );
    }

    #[test]
    fn malformed_json_is_discarded() {
        let mut r = FrameReassembler::new();
        let mut out = None;
        for frame in encode_framed(b"{not json", 4) {
            out = r.push(frame);
        }
        assert_eq!(out, None);
        assert!(!r.is_pending());
    }

    #[test]
    fn truncated_header_resets() {
        let mut r = FrameReassembler::new();
        r.push(InboundFrame::Start { total: 1 });
        assert_eq!(r.feed(&[HEADER_CHUNK, 0]), None);
        assert!(!r.is_pending());
        assert_eq!(
            InboundFrame::parse(&[0x13, 0, 1]),
            Err(FrameError::UnknownTag(0x13))
        );
    }

    #[test]
    fn direct_mode() {
        let mut d = NetworksDecoder::new(ReassemblyMode::Direct);
        assert_eq!(d.decode(SCAN.as_bytes()), Some(scan()));
        assert_eq!(d.decode(b"[{\"ssid\": 5}]"), None);
    }

    #[test]
    fn mode_from_str() {
        assert_eq!("Framed".parse::<ReassemblyMode>(), Ok(ReassemblyMode::Framed));
        assert_eq!("direct".parse::<ReassemblyMode>(), Ok(ReassemblyMode::Direct));
        assert!("auto".parse::<ReassemblyMode>().is_err());
    }

    /// A start frame and its chunks in arbitrary order.
    fn shuffled_scan() -> impl Strategy<Value = (InboundFrame, Vec<InboundFrame>)> {
        (1usize..24).prop_flat_map(|chunk_len| {
            let frames = encode_framed(SCAN.as_bytes(), chunk_len);
            (Just(frames[0].clone()), Just(frames[1..].to_vec()).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn any_arrival_order_yields_same_value((start, chunks) in shuffled_scan()) {
            let mut r = FrameReassembler::new();
            prop_assert_eq!(r.push(start), None);
            let mut out = None;
            for (i, chunk) in chunks.iter().cloned().enumerate() {
                out = r.push(chunk);
                if i + 1 < chunks.len() {
                    prop_assert!(out.is_none());
                }
            }
            prop_assert_eq!(out, Some(scan()));
            prop_assert!(!r.is_pending());
        }
    }
}
