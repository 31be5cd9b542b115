//! Launcher trailer packing.
//!
//! A finished projector for trailer-based targets is a stock launcher
//! executable with the patched player and the caller's content appended
//! after it, compressed, followed by a fixed 16-byte tail:
//!
//! ```text
//! [launcher][zlib-compressed payload][8-byte magic][payload length, u64 LE]
//! ```
//!
//! The launcher finds its payload by reading the tail of its own file:
//! the last 16 bytes give the magic and the compressed length, which
//! locate the payload without any scan of the launcher body. A launcher
//! with no tail magic is simply unprovisioned.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use scroll::{Pread, LE};

use crate::error::{Error, Result};

pub const TRAILER_MAGIC: [u8; 8] = *b"PRJTRL01";
const TAIL_SIZE: usize = 16;
const PAYLOAD_VERSION: u8 = 1;

/// Everything the launcher needs at runtime, packed into the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherPayload {
    /// Window title the launcher passes to the player.
    pub title: String,
    /// File name to materialize the player under.
    pub player_name: String,
    pub player: Vec<u8>,
    /// File name to materialize the content under.
    pub content_name: String,
    pub content: Vec<u8>,
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_bytes<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let len: u32 = buf
        .pread_with(*offset, LE)
        .map_err(|_| Error::malformed("trailer payload truncated"))?;
    let start = *offset + 4;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| Error::malformed("trailer payload field overflows"))?;
    let bytes = buf
        .get(start..end)
        .ok_or_else(|| Error::malformed("trailer payload truncated"))?;
    *offset = end;
    Ok(bytes)
}

fn take_string(buf: &[u8], offset: &mut usize) -> Result<String> {
    String::from_utf8(take_bytes(buf, offset)?.to_vec())
        .map_err(|_| Error::malformed("trailer payload string is not UTF-8"))
}

impl LauncherPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + 20 + self.title.len()
                + self.player_name.len()
                + self.player.len()
                + self.content_name.len()
                + self.content.len(),
        );
        out.push(PAYLOAD_VERSION);
        put_bytes(&mut out, self.title.as_bytes());
        put_bytes(&mut out, self.player_name.as_bytes());
        put_bytes(&mut out, &self.player);
        put_bytes(&mut out, self.content_name.as_bytes());
        put_bytes(&mut out, &self.content);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let version = *buf
            .first()
            .ok_or_else(|| Error::malformed("trailer payload is empty"))?;
        if version != PAYLOAD_VERSION {
            return Err(Error::malformed(format!(
                "unsupported trailer payload version {version}"
            )));
        }
        let mut offset = 1;
        let payload = LauncherPayload {
            title: take_string(buf, &mut offset)?,
            player_name: take_string(buf, &mut offset)?,
            player: take_bytes(buf, &mut offset)?.to_vec(),
            content_name: take_string(buf, &mut offset)?,
            content: take_bytes(buf, &mut offset)?.to_vec(),
        };
        if offset != buf.len() {
            return Err(Error::malformed("trailing garbage after payload record"));
        }
        Ok(payload)
    }
}

/// Append a compressed payload trailer to a launcher executable.
pub fn embed(launcher: &[u8], payload: &LauncherPayload) -> Result<Vec<u8>> {
    if launcher.is_empty() {
        return Err(Error::malformed("launcher executable is empty"));
    }
    let record = payload.encode();
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&record)?;
    let compressed = encoder.finish()?;
    debug!(
        "trailer payload: {} bytes raw, {} compressed",
        record.len(),
        compressed.len()
    );

    let mut out = Vec::with_capacity(launcher.len() + compressed.len() + TAIL_SIZE);
    out.extend_from_slice(launcher);
    out.extend_from_slice(&compressed);
    out.extend_from_slice(&TRAILER_MAGIC);
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    Ok(out)
}

/// Read a trailer back out of a provisioned launcher.
///
/// Returns the launcher length and the decoded payload, or `None` when
/// the file carries no trailer magic.
pub fn extract(bytes: &[u8]) -> Result<Option<(usize, LauncherPayload)>> {
    if bytes.len() < TAIL_SIZE {
        return Ok(None);
    }
    let magic_at = bytes.len() - TAIL_SIZE;
    if bytes[magic_at..magic_at + 8] != TRAILER_MAGIC {
        return Ok(None);
    }
    let compressed_len: u64 = bytes
        .pread_with(magic_at + 8, LE)
        .map_err(|_| Error::malformed("trailer tail truncated"))?;
    let compressed_len = usize::try_from(compressed_len)
        .map_err(|_| Error::malformed("trailer length overflows"))?;
    let payload_at = magic_at
        .checked_sub(compressed_len)
        .ok_or_else(|| Error::malformed("trailer length exceeds file"))?;
    if payload_at == 0 {
        return Err(Error::malformed("trailer leaves no room for a launcher"));
    }

    let mut decoder = ZlibDecoder::new(&bytes[payload_at..magic_at]);
    let mut record = Vec::new();
    decoder
        .read_to_end(&mut record)
        .map_err(|e| Error::malformed(format!("trailer payload does not inflate: {e}")))?;
    Ok(Some((payload_at, LauncherPayload::decode(&record)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> LauncherPayload {
        LauncherPayload {
            title: "Night Sky".into(),
            player_name: "player.bin".into(),
            player: vec![0xAB; 4096],
            content_name: "movie.swf".into(),
            content: b"FWS\x05sample".to_vec(),
        }
    }

    #[test]
    fn embed_then_extract_round_trips() {
        let launcher = vec![0xCC; 512];
        let packed = embed(&launcher, &sample_payload()).unwrap();
        let (launcher_len, payload) = extract(&packed).unwrap().unwrap();
        assert_eq!(launcher_len, 512);
        assert_eq!(payload, sample_payload());
    }

    #[test]
    fn launcher_without_trailer_yields_none() {
        assert_eq!(extract(&[0u8; 200]).unwrap(), None);
        assert_eq!(extract(&[]).unwrap(), None);
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let launcher = vec![0xCC; 64];
        let mut packed = embed(&launcher, &sample_payload()).unwrap();
        let len = packed.len();
        // Claim a payload bigger than the whole file.
        packed[len - 8..].copy_from_slice(&(1u64 << 32).to_le_bytes());
        assert!(matches!(
            extract(&packed),
            Err(Error::MalformedImage(_))
        ));
    }

    #[test]
    fn corrupt_compression_is_rejected() {
        let launcher = vec![0xCC; 64];
        let mut packed = embed(&launcher, &sample_payload()).unwrap();
        let tail = packed.len() - TAIL_SIZE;
        // Stomp the compressed stream right before the tail.
        for b in &mut packed[tail - 16..tail] {
            *b ^= 0xFF;
        }
        assert!(extract(&packed).is_err());
    }

    #[test]
    fn payload_is_compressed() {
        let launcher = vec![0xCC; 64];
        let payload = LauncherPayload {
            player: vec![0u8; 1 << 16],
            ..sample_payload()
        };
        let packed = embed(&launcher, &payload).unwrap();
        assert!(packed.len() < launcher.len() + (1 << 16));
    }
}
