//! Checksum framing
//!
//! A frame is `<body>*<HH>` where `HH` is the 8-bit wrapping sum of every
//! body byte, rendered as two uppercase hex digits. Received trailers may use either case.

use crate::error::ProtocolError;

/// Separator between a frame body and its checksum
pub const CHECKSUM_SEPARATOR: u8 = b'*';

/// Length of the `*HH` trailer appended by [`seal`]
pub const TRAILER_LEN: usize = 3;

/// 8-bit wrapping sum of all bytes
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &x| acc.wrapping_add(x))
}

/// Append the `*HH` trailer for the bytes already in `buf`
pub fn seal(buf: &mut Vec<u8>) {
    let sum = checksum(buf);
    buf.push(CHECKSUM_SEPARATOR);
    buf.extend_from_slice(format!("{:02X}", sum).as_bytes());
}

/// Validate a sealed frame and return its body
///
/// The frame is split at the last `*`. Anything other than exactly two
/// hex digits (either case) after it, or a sum mismatch, rejects the frame.
pub fn verify(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    let split = frame
        .iter()
        .rposition(|&b| b == CHECKSUM_SEPARATOR)
        .ok_or(ProtocolError::MissingChecksum)?;
    let (body, trailer) = (&frame[..split], &frame[split + 1..]);

    let digits_ok = trailer.len() == 2 && trailer.iter().all(u8::is_ascii_hexdigit);
    if !digits_ok {
        return Err(ProtocolError::MalformedChecksum(
            String::from_utf8_lossy(trailer).into_owned(),
        ));
    }
    let text = std::str::from_utf8(trailer).map_err(|_| ProtocolError::NotText)?;
    let expected = u8::from_str_radix(text, 16)
        .map_err(|_| ProtocolError::MalformedChecksum(text.to_string()))?;

    let actual = checksum(body);
    if actual != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}
