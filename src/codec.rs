//! Frame codec: framing, byte stuffing, the optional stream cipher and
//! the CRC trailer. One [`Codec`] is owned per connection and carries
//! the keystream and current encryption state across calls.

use crate::config::Encoding;
use crate::crc;
use crate::keystream::KeyStream;

const START: u8 = 0x02;
const END: u8 = 0x03;
const DLE: u8 = 0x10;
const ENCRYPTION_FLAG: u8 = 0x11;
const FIELD_SEP: u8 = 0x17;

/// A decoded frame body, prior to ACK handling or response routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// `Some(id)` for a framed request/response; `None` for an
    /// unsolicited push (body starts with `N` or `B`).
    pub id: Option<u16>,
    /// The command/response text, with the id prefix (if any) stripped.
    pub payload: String,
    /// Whether the recomputed CRC matched the one on the wire.
    pub crc_ok: bool,
}

/// Per-connection frame codec.
///
/// Holds the derived keystream (all-zero until [`Codec::set_panel_id`]
/// is called during the handshake) and the live encryption flag.
#[derive(Debug, Clone)]
pub struct Codec {
    keystream: KeyStream,
    encrypted: bool,
    encoding: Encoding,
}

impl Codec {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            keystream: KeyStream::derive(0),
            encrypted: false,
            encoding,
        }
    }

    /// Install the panel-derived keystream once `RID` has been read.
    pub fn set_panel_id(&mut self, panel_id: u32) {
        self.keystream = KeyStream::derive(panel_id);
    }

    /// Mark the session as encrypted (called after `LCL` is acked).
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Encode a request or ACK-reply frame for command id `id` (decimal,
    /// rendered as 2 digits — this covers both client request ids
    /// `1..=49` and the echoed id of an acknowledged push).
    pub fn encode(&self, id: u16, command: &str, force_encrypt: bool) -> Vec<u8> {
        let body = format!("{:02}{}\x17", id % 100, command);
        let crc = crc::hex4(body.as_bytes());
        let full = body + &crc;
        let mut bytes = self.encoding.encode(&full);

        let encrypt = force_encrypt || self.encrypted;
        if encrypt {
            self.keystream.apply(&mut bytes);
        }

        let stuffed = stuff(&bytes);
        let mut frame = Vec::with_capacity(stuffed.len() + 3);
        frame.push(START);
        if encrypt {
            frame.push(ENCRYPTION_FLAG);
        }
        frame.extend_from_slice(&stuffed);
        frame.push(END);
        frame
    }

    /// Decode a complete frame (including its `START`/`END` delimiters).
    ///
    /// As in the reference implementation, every successful decode
    /// updates the codec's own encryption flag to whatever this
    /// particular frame's flag byte says — the panel's replies carry
    /// the authoritative state, not just the client's own intent.
    pub fn decode(&mut self, frame: &[u8]) -> Option<Decoded> {
        if frame.len() < 2 {
            return None;
        }
        let encrypted = frame[1] == ENCRYPTION_FLAG;
        self.encrypted = encrypted;

        let start_offset = if encrypted { 2 } else { 1 };
        if frame.len() < start_offset + 1 {
            return None;
        }
        let payload = &frame[start_offset..frame.len() - 1];
        let mut unstuffed = unstuff(payload);
        if encrypted {
            self.keystream.apply(&mut unstuffed);
        }

        let text = self.encoding.decode(&unstuffed)?;
        let sep = text.find('\u{17}')?;
        let (command, rest) = text.split_at(sep);
        let crc_received = &rest[1..];
        let raw_command = &text[..=sep];

        let (id, command_string) = match command.as_bytes().first() {
            Some(b'N') | Some(b'B') => (None, command.to_string()),
            _ => {
                if command.len() < 2 {
                    return None;
                }
                let id = command[..2].parse::<u16>().ok()?;
                (Some(id), command[2..].to_string())
            }
        };

        let crc_ok = crc::is_valid(raw_command.as_bytes(), crc_received);
        Some(Decoded {
            id,
            payload: command_string,
            crc_ok,
        })
    }
}

/// Check whether `frame` (read so far, including its terminating byte)
/// ends in a true, unescaped `END` — i.e. not `DLE END`.
pub fn is_terminated(frame: &[u8]) -> bool {
    match frame.last() {
        Some(&b) if b == END => {
            let dle_count = frame[..frame.len() - 1]
                .iter()
                .rev()
                .take_while(|&&b| b == DLE)
                .count();
            dle_count % 2 == 0
        }
        _ => false,
    }
}

fn stuff(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        if b == DLE || b == START || b == END {
            out.push(DLE);
        }
        out.push(b);
    }
    out
}

fn unstuff(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == DLE && i + 1 < bytes.len() {
            out.push(bytes[i + 1]);
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(id: u16, cmd: &str, panel_id: u32, encrypted: bool) {
        let mut codec = Codec::new(Encoding::Utf8);
        codec.set_panel_id(panel_id);
        codec.set_encrypted(encrypted);
        let frame = codec.encode(id, cmd, false);
        assert!(is_terminated(&frame));

        let mut decoder = Codec::new(Encoding::Utf8);
        decoder.set_panel_id(panel_id);
        let decoded = decoder.decode(&frame).expect("decodes");
        assert_eq!(decoded.id, Some(id % 100));
        assert_eq!(decoded.payload, cmd);
        assert!(decoded.crc_ok);
        assert_eq!(decoder.encrypted(), encrypted);
    }

    #[test]
    fn round_trip_unencrypted() {
        for id in 1..=49u16 {
            roundtrip(id, "LCL", 0x1234, false);
        }
    }

    #[test]
    fn round_trip_encrypted() {
        for id in [1u16, 2, 25, 49] {
            roundtrip(id, "PNLCNF", 0xABCD, true);
        }
    }

    #[test]
    fn stuffing_is_involutive_on_arbitrary_bytes() {
        let data: Vec<u8> = (0..=255u8).collect();
        let stuffed = stuff(&data);
        let unstuffed = unstuff(&stuffed);
        assert_eq!(unstuffed, data);
    }

    #[test]
    fn frame_encode_matches_known_vector() {
        // id=1, cmd="LCL", unencrypted, UTF-8: body "01LCL\x17" + crc.
        let codec = Codec::new(Encoding::Utf8);
        let frame = codec.encode(1, "LCL", false);
        let crc = crc::hex4(b"01LCL\x17");
        let mut expected = vec![0x02u8];
        expected.extend_from_slice(b"01LCL\x17");
        expected.extend_from_slice(crc.as_bytes());
        expected.push(0x03);
        assert_eq!(frame, expected);
    }

    #[test]
    fn stuffed_end_byte_inside_ciphertext_round_trips() {
        // Find a panel id/command pair whose XORed bytes include 0x03,
        // forcing an escape, and confirm decode restores the original.
        for panel_id in 1u32..2000 {
            let mut codec = Codec::new(Encoding::Utf8);
            codec.set_panel_id(panel_id);
            codec.set_encrypted(true);
            let frame = codec.encode(1, "PNLCNF", false);
            // Detect an escaped END/START/DLE byte appeared in the body.
            let body = &frame[2..frame.len() - 1];
            if body.windows(2).any(|w| w[0] == DLE && w[1] == END) {
                let mut decoder = Codec::new(Encoding::Utf8);
                decoder.set_panel_id(panel_id);
                let decoded = decoder.decode(&frame).unwrap();
                assert_eq!(decoded.payload, "PNLCNF");
                assert!(decoded.crc_ok);
                return;
            }
        }
        panic!("no panel id in range produced an escaped END byte");
    }

    #[test]
    fn unsolicited_push_has_no_id() {
        let mut codec = Codec::new(Encoding::Utf8);
        let body = "EVENT=armed\x17";
        let crc = crc::hex4(body.as_bytes());
        let mut frame = vec![START];
        frame.extend_from_slice(body.as_bytes());
        frame.extend_from_slice(crc.as_bytes());
        frame.push(END);
        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.id, None);
        assert_eq!(decoded.payload, "EVENT=armed");
        assert!(decoded.crc_ok);
    }

    #[test]
    fn is_terminated_rejects_escaped_end() {
        assert!(!is_terminated(&[0x41, DLE, END]));
        assert!(is_terminated(&[0x41, END]));
        assert!(is_terminated(&[0x41, DLE, DLE, END]));
    }
}
