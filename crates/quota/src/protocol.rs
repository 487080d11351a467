//! The fixed-frame command protocol driving the quota manager.
//!
//! Every write to the manager is one [`LruCommand`] frame followed by a
//! variable-length description. The total frame never exceeds 512 bytes so a
//! single `write` to the pipe is atomic per POSIX; frames from concurrent
//! clients cannot interleave.
//!
//! Wire layout, little-endian, stable across restart-compatible versions:
//!
//! | field        | width | notes                                          |
//! |--------------|-------|------------------------------------------------|
//! | command_type | 1     | [`CommandType`]                                |
//! | size         | 8     | top 3 bits algorithm, low 61 bits byte size    |
//! | return_pipe  | 4     | signed return-pipe id, -1 for none             |
//! | digest       | 20    | payload, zero-padded to the widest algorithm   |
//! | desc_length  | 2     | at most 512 - header                           |
//! | description  | var   | appended immediately after the header          |
//!
//! The size-with-flags word is a wire legacy; it is decoded into a plain
//! `(algorithm, size)` pair before any domain logic sees the value.

use crate::error::{QuotaError, QuotaResult};
use bytes::{Buf, BufMut, BytesMut};
use cairn_core::{Algorithm, Digest, MAX_DIGEST_BYTES};

/// Revision of this protocol. Reported by `GetProtocolRevision`.
pub const PROTOCOL_REVISION: u32 = 2;

/// Upper bound for a whole frame, within the POSIX pipe atomicity guarantee.
pub const MAX_FRAME_SIZE: usize = 512;

/// Fixed header width: type + size word + return pipe + digest + length.
pub const HEADER_SIZE: usize = 1 + 8 + 4 + MAX_DIGEST_BYTES + 2;

/// Maximum description length fitting the frame budget.
pub const MAX_DESCRIPTION: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Number of contiguous insert/touch frames coalesced into one transactional
/// index update on the server side.
pub const COMMAND_BUFFER_SIZE: usize = 32;

const SIZE_MASK: u64 = (1 << 61) - 1;

/// Single-byte opcodes broadcast over registered back channels.
pub mod backchannel {
    /// A cleanup run is starting.
    pub const CLEANUP_START: u8 = b'C';
    /// A cleanup run finished.
    pub const CLEANUP_FINISH: u8 = b'F';
    /// The manager is shutting down.
    pub const RELEASE: u8 = b'R';
}

/// RPCs understood by the cache manager.
///
/// Wire values are stable; an old manager may serve newer clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Touch = 0,
    Insert = 1,
    Reserve = 2,
    Pin = 3,
    Unpin = 4,
    Remove = 5,
    Cleanup = 6,
    List = 7,
    ListPinned = 8,
    ListCatalogs = 9,
    Status = 10,
    Limits = 11,
    Pid = 12,
    PinRegular = 13,
    RegisterBackChannel = 14,
    UnregisterBackChannel = 15,
    GetProtocolRevision = 16,
    InsertVolatile = 17,
    // As of protocol revision 2.
    ListVolatile = 18,
    CleanupRate = 19,
}

impl CommandType {
    pub fn from_wire(value: u8) -> Option<CommandType> {
        use CommandType::*;
        Some(match value {
            0 => Touch,
            1 => Insert,
            2 => Reserve,
            3 => Pin,
            4 => Unpin,
            5 => Remove,
            6 => Cleanup,
            7 => List,
            8 => ListPinned,
            9 => ListCatalogs,
            10 => Status,
            11 => Limits,
            12 => Pid,
            13 => PinRegular,
            14 => RegisterBackChannel,
            15 => UnregisterBackChannel,
            16 => GetProtocolRevision,
            17 => InsertVolatile,
            18 => ListVolatile,
            19 => CleanupRate,
            _ => return None,
        })
    }

    /// True for the commands the server may coalesce into batches.
    pub fn is_batchable(self) -> bool {
        matches!(
            self,
            CommandType::Touch | CommandType::Insert | CommandType::InsertVolatile
        )
    }
}

/// A decoded command frame.
#[derive(Clone, Debug)]
pub struct LruCommand {
    pub command_type: CommandType,
    /// Object size in bytes; at most 2^61 - 1.
    pub size: u64,
    /// Return-pipe id for commands that reply, -1 otherwise.
    pub return_pipe: i32,
    /// Object digest; the null MD5 digest for commands without one.
    pub hash: Digest,
    /// Free-form description, usually the object's repository path.
    pub description: String,
}

impl LruCommand {
    /// A command without payload fields.
    pub fn bare(command_type: CommandType) -> Self {
        Self {
            command_type,
            size: 0,
            return_pipe: -1,
            hash: Digest::null(Algorithm::Md5),
            description: String::new(),
        }
    }

    /// A command addressing one object.
    pub fn for_object(command_type: CommandType, hash: &Digest) -> Self {
        Self {
            hash: *hash,
            ..Self::bare(command_type)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_return_pipe(mut self, return_pipe: i32) -> Self {
        self.return_pipe = return_pipe;
        self
    }

    /// Attach a description. Anything beyond the frame budget is truncated
    /// on the wire.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Encode into a single wire frame.
    pub fn encode(&self) -> BytesMut {
        let mut description = self.description.as_bytes();
        if description.len() > MAX_DESCRIPTION {
            tracing::debug!(
                length = description.len(),
                "truncating over-long command description"
            );
            let mut end = MAX_DESCRIPTION;
            while end > 0 && !self.description.is_char_boundary(end) {
                end -= 1;
            }
            description = &description[..end];
        }

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + description.len());
        frame.put_u8(self.command_type as u8);
        let size_word =
            (self.size & SIZE_MASK) | (u64::from(self.hash.algorithm().to_wire()) << 61);
        frame.put_u64_le(size_word);
        frame.put_i32_le(self.return_pipe);
        let payload = self.hash.as_bytes();
        frame.put_slice(payload);
        frame.put_bytes(0, MAX_DIGEST_BYTES - payload.len());
        frame.put_u16_le(description.len() as u16);
        frame.put_slice(description);
        frame
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns the command and the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> QuotaResult<Option<(LruCommand, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_SIZE];
    let type_byte = header.get_u8();
    let size_word = header.get_u64_le();
    let return_pipe = header.get_i32_le();
    let mut payload = [0u8; MAX_DIGEST_BYTES];
    header.copy_to_slice(&mut payload);
    let desc_length = header.get_u16_le() as usize;

    let command_type = CommandType::from_wire(type_byte)
        .ok_or_else(|| QuotaError::ProtocolFrame(format!("unknown command type {type_byte}")))?;
    if desc_length > MAX_DESCRIPTION {
        return Err(QuotaError::ProtocolFrame(format!(
            "description length {desc_length} exceeds frame budget"
        )));
    }
    if buf.len() < HEADER_SIZE + desc_length {
        return Ok(None);
    }

    let algorithm = Algorithm::from_wire((size_word >> 61) as u8).ok_or_else(|| {
        QuotaError::ProtocolFrame(format!("unknown algorithm flags {}", size_word >> 61))
    })?;
    let hash = Digest::from_bytes(algorithm, &payload[..algorithm.digest_size()])
        .map_err(|e| QuotaError::ProtocolFrame(e.to_string()))?;
    let description = String::from_utf8(buf[HEADER_SIZE..HEADER_SIZE + desc_length].to_vec())
        .map_err(|e| QuotaError::ProtocolFrame(format!("description not utf-8: {e}")))?;

    Ok(Some((
        LruCommand {
            command_type,
            size: size_word & SIZE_MASK,
            return_pipe,
            hash,
            description,
        },
        HEADER_SIZE + desc_length,
    )))
}

/// Encode one reply record: u32 length prefix plus UTF-8 payload. A
/// zero-length record terminates the reply stream.
pub fn encode_reply_line(line: &str) -> BytesMut {
    let mut out = BytesMut::with_capacity(4 + line.len());
    out.put_u32_le(line.len() as u32);
    out.put_slice(line.as_bytes());
    out
}

/// The reply-stream terminator record.
pub fn encode_reply_end() -> BytesMut {
    let mut out = BytesMut::with_capacity(4);
    out.put_u32_le(0);
    out
}

/// Decode one reply record from the front of `buf`. `Some(None)` marks the
/// terminator record.
#[allow(clippy::type_complexity)]
pub fn decode_reply_line(buf: &[u8]) -> QuotaResult<Option<(Option<String>, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let mut header = &buf[..4];
    let length = header.get_u32_le() as usize;
    if length == 0 {
        return Ok(Some((None, 4)));
    }
    if buf.len() < 4 + length {
        return Ok(None);
    }
    let line = String::from_utf8(buf[4..4 + length].to_vec())
        .map_err(|e| QuotaError::ProtocolFrame(format!("reply not utf-8: {e}")))?;
    Ok(Some((Some(line), 4 + length)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::digest::hash_mem;

    #[test]
    fn test_frame_roundtrip() {
        for algorithm in Algorithm::ALL {
            let hash = hash_mem(b"frame", algorithm);
            let command = LruCommand::for_object(CommandType::Insert, &hash)
                .with_size(4096)
                .with_return_pipe(7)
                .with_description("/repo/data/file");

            let frame = command.encode();
            assert!(frame.len() <= MAX_FRAME_SIZE);

            let (decoded, consumed) = decode_frame(&frame).unwrap().unwrap();
            assert_eq!(consumed, frame.len());
            assert_eq!(decoded.command_type, CommandType::Insert);
            assert_eq!(decoded.size, 4096);
            assert_eq!(decoded.return_pipe, 7);
            assert_eq!(decoded.hash, hash);
            assert_eq!(decoded.description, "/repo/data/file");
        }
    }

    #[test]
    fn test_size_and_algorithm_share_the_word() {
        let hash = hash_mem(b"x", Algorithm::Shake128);
        let command = LruCommand::for_object(CommandType::Insert, &hash).with_size(SIZE_MASK);
        let (decoded, _) = decode_frame(&command.encode()).unwrap().unwrap();
        assert_eq!(decoded.size, SIZE_MASK);
        assert_eq!(decoded.hash.algorithm(), Algorithm::Shake128);
    }

    #[test]
    fn test_partial_frame_is_incomplete_not_error() {
        let hash = hash_mem(b"partial", Algorithm::Sha1);
        let frame = LruCommand::for_object(CommandType::Touch, &hash).encode();
        assert!(decode_frame(&frame[..HEADER_SIZE - 1]).unwrap().is_none());

        let with_desc = LruCommand::for_object(CommandType::Insert, &hash)
            .with_description("description")
            .encode();
        assert!(
            decode_frame(&with_desc[..with_desc.len() - 1])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_unknown_command_type_is_a_frame_error() {
        let hash = hash_mem(b"bad", Algorithm::Sha1);
        let mut frame = LruCommand::for_object(CommandType::Touch, &hash).encode();
        frame[0] = 250;
        assert!(matches!(
            decode_frame(&frame),
            Err(QuotaError::ProtocolFrame(_))
        ));
    }

    #[test]
    fn test_over_long_description_is_truncated() {
        let hash = hash_mem(b"long", Algorithm::Sha1);
        let description = "d".repeat(2 * MAX_FRAME_SIZE);
        let frame = LruCommand::for_object(CommandType::Insert, &hash)
            .with_description(description)
            .encode();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);

        let (decoded, _) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(decoded.description.len(), MAX_DESCRIPTION);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let first = LruCommand::for_object(
            CommandType::Insert,
            &hash_mem(b"first", Algorithm::Sha1),
        )
        .with_description("one")
        .encode();
        let second =
            LruCommand::for_object(CommandType::Touch, &hash_mem(b"second", Algorithm::Sha1))
                .encode();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let (a, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(a.command_type, CommandType::Insert);
        let (b, rest) = decode_frame(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(b.command_type, CommandType::Touch);
        assert_eq!(consumed + rest, buf.len());
    }

    #[test]
    fn test_reply_record_roundtrip() {
        let line = encode_reply_line("gauge 42");
        let end = encode_reply_end();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&line);
        buf.extend_from_slice(&end);

        let (first, consumed) = decode_reply_line(&buf).unwrap().unwrap();
        assert_eq!(first.as_deref(), Some("gauge 42"));
        let (terminator, _) = decode_reply_line(&buf[consumed..]).unwrap().unwrap();
        assert!(terminator.is_none());
    }

    #[test]
    fn test_command_type_wire_values_are_stable() {
        assert_eq!(CommandType::Touch as u8, 0);
        assert_eq!(CommandType::GetProtocolRevision as u8, 16);
        assert_eq!(CommandType::CleanupRate as u8, 19);
        for value in 0..=19u8 {
            let parsed = CommandType::from_wire(value).unwrap();
            assert_eq!(parsed as u8, value);
        }
        assert!(CommandType::from_wire(20).is_none());
    }
}
