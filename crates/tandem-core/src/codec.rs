//! Length-prefixed CBOR framing for tandem packets.
//!
//! Wire format: `[10-byte ASCII decimal length, left-justified, space-padded][CBOR packet]`

use crate::error::{TandemError, TandemResult};
use crate::packet::Packet;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Width of the length header in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest body accepted from a peer.
pub const MAX_PACKET_LEN: usize = 64 * 1024 * 1024;

/// Largest length a 10-digit header can express.
const MAX_HEADER_VALUE: u64 = 9_999_999_999;

/// Render a body length as the fixed-width header.
pub fn encode_header(len: usize) -> TandemResult<[u8; HEADER_LEN]> {
    if len as u64 > MAX_HEADER_VALUE {
        return Err(TandemError::PacketTooLarge(len));
    }
    let text = format!("{len:<width$}", width = HEADER_LEN);
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(text.as_bytes());
    Ok(header)
}

/// Parse a fixed-width header back into a body length.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> TandemResult<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| TandemError::MalformedHeader(String::from_utf8_lossy(header).into_owned()))?;
    let digits = text.trim_matches(' ');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TandemError::MalformedHeader(text.to_string()));
    }
    digits
        .parse::<usize>()
        .map_err(|_| TandemError::MalformedHeader(text.to_string()))
}

/// Encode a packet into a complete frame (header followed by body).
pub fn encode_packet(packet: &Packet) -> TandemResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(packet, &mut body)?;

    let header = encode_header(body.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&header);
    frame.extend(body);
    Ok(frame)
}

/// Decode a CBOR body (without header) into a packet.
pub fn decode_body(body: &[u8]) -> TandemResult<Packet> {
    let packet: Packet = ciborium::from_reader(Cursor::new(body))?;
    Ok(packet)
}

/// Read one packet, tolerating arbitrarily fragmented reads.
///
/// End of stream before the first header byte is a clean [`TandemError::TransportClosed`];
/// end of stream anywhere later is a [`TandemError::ShortRead`].
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> TandemResult<Packet> {
    read_packet_limited(reader, MAX_PACKET_LEN).await
}

/// [`read_packet`] with a caller-chosen body size limit.
pub async fn read_packet_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> TandemResult<Packet> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(TandemError::TransportClosed);
    }
    if got < HEADER_LEN {
        return Err(TandemError::ShortRead {
            expected: HEADER_LEN,
            received: got,
        });
    }

    let len = parse_header(&header)?;
    if len > max_len {
        return Err(TandemError::PacketTooLarge(len));
    }

    let mut body = vec![0u8; len];
    let got = read_full(reader, &mut body).await?;
    if got < len {
        return Err(TandemError::ShortRead {
            expected: len,
            received: got,
        });
    }

    decode_body(&body)
}

/// Write one packet in full, or fail with [`TandemError::TransportClosed`].
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> TandemResult<()> {
    let frame = encode_packet(packet)?;
    if let Err(e) = writer.write_all(&frame).await {
        debug!(error = %e, "packet write failed");
        return Err(TandemError::TransportClosed);
    }
    if let Err(e) = writer.flush().await {
        debug!(error = %e, "packet flush failed");
        return Err(TandemError::TransportClosed);
    }
    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
/// Returns the number of bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> TandemResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
