//! Frame codec.
//!
//! Every frame starts with a fixed 5-byte prefix: a type tag, the
//! 16-bit route key (big-endian), and the 16-bit session nonce
//! (big-endian), followed by a type-dependent payload. MSG and ACK
//! payloads are step-tagged (u32 little-endian); SIG payloads carry a
//! step plus a one-byte signal code.

/// Frame header length: type byte + key + nonce.
pub const HEADER_LEN: usize = 5;

/// Step prefix length inside MSG/ACK/SIG payloads.
pub const STEP_LEN: usize = 4;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Reserved session pre-open tag; never emitted by this runtime.
    Opn = 0,
    /// Session control signal (INIT / TERM and their acknowledgements).
    Sig = 1,
    /// Sequenced application payload.
    Msg = 2,
    /// Acknowledgement of a MSG (or of a SIG step).
    Ack = 3,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Opn),
            1 => Some(FrameKind::Sig),
            2 => Some(FrameKind::Msg),
            3 => Some(FrameKind::Ack),
            _ => None,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    /// Stable route identifier.
    pub key: u16,
    /// Session identifier; 0 for session control not yet assigned a
    /// nonce by the initiator.
    pub nonce: u16,
}

impl Header {
    pub fn new(kind: FrameKind, key: u16, nonce: u16) -> Self {
        Self { kind, key, nonce }
    }

    /// Write the 5-byte header followed by `payload`.
    pub fn brand(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(self.kind as u8);
        frame.extend_from_slice(&self.key.to_be_bytes());
        frame.extend_from_slice(&self.nonce.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Parse a header without constraints.
    pub fn parse(bytes: &[u8]) -> Option<(Header, &[u8])> {
        Pattern::any().matches(bytes)
    }
}

/// Partial header constraint used by filtered receives.
///
/// Unset fields match anything; a set field must equal the parsed
/// value exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pattern {
    pub kind: Option<FrameKind>,
    pub key: Option<u16>,
    pub nonce: Option<u16>,
}

impl Pattern {
    /// Match every well-formed frame.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn of(kind: FrameKind, key: u16, nonce: u16) -> Self {
        Self {
            kind: Some(kind),
            key: Some(key),
            nonce: Some(nonce),
        }
    }

    pub fn with_kind(mut self, kind: FrameKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_key(mut self, key: u16) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_nonce(mut self, nonce: u16) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Parse the header and apply the constraints.
    ///
    /// Returns the header and the payload slice, or `None` when the
    /// frame is malformed, the type byte is out of the enum, or a
    /// constrained field disagrees.
    pub fn matches<'a>(&self, bytes: &'a [u8]) -> Option<(Header, &'a [u8])> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let kind = FrameKind::from_byte(bytes[0])?;
        let key = u16::from_be_bytes([bytes[1], bytes[2]]);
        let nonce = u16::from_be_bytes([bytes[3], bytes[4]]);

        if self.kind.is_some_and(|want| want != kind) {
            return None;
        }
        if self.key.is_some_and(|want| want != key) {
            return None;
        }
        if self.nonce.is_some_and(|want| want != nonce) {
            return None;
        }
        Some((Header { kind, key, nonce }, &bytes[HEADER_LEN..]))
    }
}

/// Prefix `body` with a 4-byte little-endian step.
pub fn brand_step(step: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(STEP_LEN + body.len());
    payload.extend_from_slice(&step.to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Parse a step-tagged payload, validating the step when constrained.
pub fn match_step(expect: Option<u32>, payload: &[u8]) -> Option<(u32, &[u8])> {
    if payload.len() < STEP_LEN {
        return None;
    }
    let step = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if expect.is_some_and(|want| want != step) {
        return None;
    }
    Some((step, &payload[STEP_LEN..]))
}

/// Session control signal carried inside SIG frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    Init = 0,
    Term = 1,
}

impl Signal {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Signal::Init),
            1 => Some(Signal::Term),
            _ => None,
        }
    }
}

/// Build a SIG payload: step prefix plus the one-byte signal code.
pub fn brand_signal(step: u32, signal: Signal) -> Vec<u8> {
    brand_step(step, &[signal as u8])
}

/// Parse a SIG payload, validating the step when constrained.
pub fn match_signal(expect_step: Option<u32>, payload: &[u8]) -> Option<(u32, Signal)> {
    let (step, body) = match_step(expect_step, payload)?;
    if body.len() != 1 {
        return None;
    }
    Some((step, Signal::from_byte(body[0])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_frame_wire_exactness() {
        // key=1, nonce=4, step=1, body [0x00].
        let header = Header::new(FrameKind::Msg, 1, 4);
        let frame = header.brand(&brand_step(1, &[0x00]));
        assert_eq!(
            frame,
            vec![0x02, 0x00, 0x01, 0x00, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sig_init_payload_layout() {
        let payload = brand_signal(0, Signal::Init);
        assert_eq!(payload, vec![0x00, 0x00, 0x00, 0x00, 0x00]);

        let payload = brand_signal(7, Signal::Term);
        assert_eq!(payload, vec![0x07, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header::new(FrameKind::Ack, 0xDEAD, 0xBEEF);
        let frame = header.brand(&[1, 2, 3]);

        let (parsed, payload) = Header::parse(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_pattern_constraints() {
        let frame = Header::new(FrameKind::Msg, 10, 20).brand(&[]);

        assert!(Pattern::of(FrameKind::Msg, 10, 20).matches(&frame).is_some());
        assert!(Pattern::any().with_kind(FrameKind::Msg).matches(&frame).is_some());
        // Any disagreeing constrained field rejects the frame.
        assert!(Pattern::of(FrameKind::Ack, 10, 20).matches(&frame).is_none());
        assert!(Pattern::any().with_key(11).matches(&frame).is_none());
        assert!(Pattern::any().with_nonce(21).matches(&frame).is_none());
    }

    #[test]
    fn test_unknown_type_byte_rejected() {
        let mut frame = Header::new(FrameKind::Msg, 1, 1).brand(&[]);
        frame[0] = 9;
        assert!(Pattern::any().matches(&frame).is_none());
    }

    #[test]
    fn test_truncated_frames_rejected() {
        assert!(Pattern::any().matches(&[0x02, 0x00]).is_none());
        assert!(match_step(None, &[0x01, 0x00]).is_none());
        assert!(match_signal(None, &[0x00, 0x00, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_step_validation() {
        let payload = brand_step(42, b"body");
        assert_eq!(match_step(None, &payload), Some((42, &b"body"[..])));
        assert_eq!(match_step(Some(42), &payload), Some((42, &b"body"[..])));
        assert_eq!(match_step(Some(43), &payload), None);
    }

    #[test]
    fn test_signal_rejects_trailing_or_unknown_bytes() {
        assert!(match_signal(None, &brand_step(0, &[0, 0])).is_none());
        assert!(match_signal(None, &brand_step(0, &[2])).is_none());
    }

    #[test]
    fn test_arbitrary_frames_round_trip() {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let header = Header::new(
                match rng.gen_range(0..4u8) {
                    0 => FrameKind::Opn,
                    1 => FrameKind::Sig,
                    2 => FrameKind::Msg,
                    _ => FrameKind::Ack,
                },
                rng.gen(),
                rng.gen(),
            );
            let step: u32 = rng.gen();
            let body: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();

            let bytes = header.brand(&brand_step(step, &body));
            let (parsed, payload) = Header::parse(&bytes).unwrap();
            assert_eq!(parsed, header);
            assert_eq!(match_step(Some(step), payload), Some((step, body.as_slice())));
        }
    }
}
