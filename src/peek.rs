//! Protocol peeking on freshly accepted connections.
//!
//! The demultiplexer reads the first bytes of a connection exactly once and
//! needs to know who the client is trying to reach before any protocol
//! machinery runs: either the SNI of a TLS ClientHello or the `Host` header
//! of an HTTP/1.x request. Both extractors here are pure functions over a
//! byte slice; they never consume the caller's buffer and never panic on
//! truncated input.
//!
//! TLS record layout walked by [`extract_sni`]:
//!
//! - byte 0: record type (0x16 = handshake)
//! - bytes 1-2: record version
//! - bytes 3-4: record length
//! - byte 5: handshake type (0x01 = ClientHello)
//! - bytes 6-8: handshake length
//! - then: version(2) + random(32) + session_id(1+n) + cipher_suites(2+n)
//!   + compression(1+n) + extensions(2+n)

use thiserror::Error;

/// Reasons the peeked bytes could not be classified.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeekError {
    /// The buffer ended before a required field.
    #[error("peeked data truncated")]
    Truncated,

    /// The first byte is not a TLS handshake record.
    #[error("not a TLS handshake")]
    NotTls,

    /// The handshake message is not a ClientHello.
    #[error("not a ClientHello")]
    NotClientHello,

    /// The ClientHello carries no server_name extension.
    #[error("no SNI")]
    NoSni,

    /// The server name is not valid UTF-8.
    #[error("server name is not valid UTF-8")]
    InvalidServerName,

    /// The bytes are not a recognizable HTTP/1.x request.
    #[error("not an HTTP request")]
    NotHttp,

    /// The request has no Host header.
    #[error("no Host header")]
    NoHost,
}

/// Extracts the SNI hostname from a TLS ClientHello.
///
/// Every length field is bounds-checked against the buffer. The record-length
/// field is deliberately ignored: a ClientHello split across packets may
/// declare more bytes than were peeked, and the extensions we need usually
/// fit in the first segment. Only the first server_name entry is considered.
pub fn extract_sni(data: &[u8]) -> Result<String, PeekError> {
    if data.len() < 5 {
        return Err(PeekError::Truncated);
    }
    if data[0] != 0x16 {
        return Err(PeekError::NotTls);
    }

    // Handshake header: type(1) + length(3).
    let mut pos = 5;
    if pos >= data.len() {
        return Err(PeekError::Truncated);
    }
    if data[pos] != 0x01 {
        return Err(PeekError::NotClientHello);
    }
    pos += 4;

    // Client version.
    if pos + 2 > data.len() {
        return Err(PeekError::Truncated);
    }
    pos += 2;

    // Random.
    if pos + 32 > data.len() {
        return Err(PeekError::Truncated);
    }
    pos += 32;

    // Session ID.
    if pos + 1 > data.len() {
        return Err(PeekError::Truncated);
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    // Cipher suites.
    if pos + 2 > data.len() {
        return Err(PeekError::Truncated);
    }
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // Compression methods.
    if pos + 1 > data.len() {
        return Err(PeekError::Truncated);
    }
    let compression_len = data[pos] as usize;
    pos += 1 + compression_len;

    // Extensions vector.
    if pos + 2 > data.len() {
        return Err(PeekError::Truncated);
    }
    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    let end = (pos + extensions_len).min(data.len());

    while pos + 4 <= end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;

        if ext_type == 0x0000 && pos + ext_len <= end {
            // server_name_list length.
            if pos + 2 > end {
                break;
            }
            pos += 2;

            // First entry: name type(1) + name length(2).
            if pos + 3 > end {
                break;
            }
            let name_type = data[pos];
            let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
            pos += 3;

            if name_type == 0x00 && pos + name_len <= end {
                return std::str::from_utf8(&data[pos..pos + name_len])
                    .map(str::to_owned)
                    .map_err(|_| PeekError::InvalidServerName);
            }
            break;
        }
        pos += ext_len;
    }

    Err(PeekError::NoSni)
}

/// Extracts the `Host` header from the prologue of an HTTP/1.x request.
///
/// The value is returned verbatim, including any `:port`. Fails when the
/// bytes are not a recognizable request or the header section is incomplete.
pub fn extract_host(data: &[u8]) -> Result<String, PeekError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .ok_or(PeekError::NoHost)
            .and_then(|h| {
                std::str::from_utf8(h.value)
                    .map(str::to_owned)
                    .map_err(|_| PeekError::NotHttp)
            }),
        Ok(httparse::Status::Partial) => Err(PeekError::NotHttp),
        Err(_) => Err(PeekError::NotHttp),
    }
}

#[cfg(test)]
pub(crate) fn client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    let mut sni_ext = Vec::new();
    sni_ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // server_name_list length
    sni_ext.push(0x00); // name type: host_name
    sni_ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_ext.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&[0x00, 0x00]); // extension type: server_name
    extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_ext);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client version: TLS 1.2
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0x00); // session ID length
    body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.push(0x00);
    handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
