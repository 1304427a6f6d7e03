//! Streaming storage backend: hex-over-text on the serial console.
//!
//! Write-only and connectionless.  A "file" is a framed transfer:
//!
//! ```text
//! BEGIN:<filename>
//! SIZE:<decimal byte count>
//! <uppercase hex pairs, 32 bytes per line, a space after every 8th byte>
//! ...
//! END:<filename>
//! ```
//!
//! PROGRESS and ABORT marker lines may appear between data lines; receivers
//! must skip them.  This framing is the one externally-consumed, bit-exact
//! format in the system - operator-side tools parse it back to binary.
//!
//! There is no file table behind this backend, so everything that queries
//! one (exists/size/list/delete) fails cleanly rather than pretending.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::fmt::Write as _;
use embedded_io::{Read, Write};

use super::StoragePlugin;
use crate::constants::{
    HEX_BYTES_PER_LINE, HEX_GROUP_SIZE, MAX_FILENAME_LEN, STREAM_PROGRESS_INTERVAL,
};
use crate::types::{FileName, StatusCode, StatusLine, StorageKind};

const CRLF: &str = "\r\n";

/// One rendered hex line: 64 hex chars + grouping spaces + CRLF, with room
/// for the markers.
type LineBuf = heapless::String<96>;

fn to_hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'A' + nibble - 10) as char,
    }
}

fn from_hex_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}

/// The streaming storage backend, over any byte sink (the serial console on
/// hardware, a capture buffer in tests).
pub struct StreamStorage<W: Write> {
    port: W,
    initialized: bool,
    transfer_in_progress: bool,
    current_file: FileName,
    progress_enabled: bool,
    files_streamed: u32,
    bytes_streamed: u32,
}

impl<W: Write> StreamStorage<W> {
    pub fn new(port: W) -> Self {
        Self {
            port,
            initialized: false,
            transfer_in_progress: false,
            current_file: FileName::new(),
            progress_enabled: false,
            files_streamed: 0,
            bytes_streamed: 0,
        }
    }

    /// Enable the periodic PROGRESS marker lines.
    pub fn set_progress_enabled(&mut self, enabled: bool) {
        self.progress_enabled = enabled;
    }

    pub fn is_transfer_in_progress(&self) -> bool {
        self.transfer_in_progress
    }

    /// (files streamed, bytes streamed) since the last reset.
    pub fn transfer_stats(&self) -> (u32, u32) {
        (self.files_streamed, self.bytes_streamed)
    }

    pub fn reset_transfer_stats(&mut self) {
        self.files_streamed = 0;
        self.bytes_streamed = 0;
    }

    /// Access to the underlying sink, for tests and the debug shell.
    pub fn port_mut(&mut self) -> &mut W {
        &mut self.port
    }

    fn send_line(&mut self, line: &str) -> bool {
        self.port.write_all(line.as_bytes()).is_ok()
            && self.port.write_all(CRLF.as_bytes()).is_ok()
    }

    fn send_header(&mut self, name: &str, size: usize) -> bool {
        let mut line = LineBuf::new();
        if write!(line, "BEGIN:{}", name).is_err() {
            return false;
        }
        if !self.send_line(&line) {
            return false;
        }
        line.clear();
        if write!(line, "SIZE:{}", size).is_err() {
            return false;
        }
        self.send_line(&line)
    }

    fn send_footer(&mut self, name: &str) -> bool {
        let mut line = LineBuf::new();
        if write!(line, "END:{}", name).is_err() {
            return false;
        }
        self.send_line(&line)
    }

    /// Render and send one line of up to HEX_BYTES_PER_LINE bytes.
    fn send_hex_line(&mut self, data: &[u8]) -> bool {
        let mut line = LineBuf::new();
        for (i, &byte) in data.iter().enumerate() {
            let _ = line.push(to_hex_digit(byte >> 4));
            let _ = line.push(to_hex_digit(byte & 0x0F));
            // A readability space after every group, except at line end.
            if (i + 1) % HEX_GROUP_SIZE == 0 && i + 1 < data.len() {
                let _ = line.push(' ');
            }
        }
        self.send_line(&line)
    }

    fn send_progress(&mut self, name: &str, sent: usize, total: usize) {
        if !self.progress_enabled {
            return;
        }
        let percent = if total > 0 { sent * 100 / total } else { 0 };
        let mut line = LineBuf::new();
        if write!(line, "PROGRESS:{}:{}/{} ({}%)", name, sent, total, percent).is_ok() {
            self.send_line(&line);
        }
    }

    /// Stream `data` as one framed transfer.  Returns the number of bytes
    /// streamed (all or nothing: a sink failure mid-transfer aborts and
    /// returns 0).
    pub fn stream_file(&mut self, name: &str, data: &[u8]) -> usize {
        if !self.initialized || name.is_empty() || name.len() > MAX_FILENAME_LEN || data.is_empty()
        {
            return 0;
        }
        if self.transfer_in_progress {
            warn!("Stream: transfer already in progress");
            return 0;
        }

        self.transfer_in_progress = true;
        self.current_file.clear();
        let _ = self.current_file.push_str(name);

        if !self.send_header(name, data.len()) {
            self.abort_transfer();
            return 0;
        }

        let mut sent = 0;
        for chunk in data.chunks(HEX_BYTES_PER_LINE) {
            if !self.send_hex_line(chunk) {
                self.abort_transfer();
                return 0;
            }
            sent += chunk.len();
            if sent % STREAM_PROGRESS_INTERVAL == 0 {
                self.send_progress(name, sent, data.len());
            }
        }

        if !self.send_footer(name) {
            self.abort_transfer();
            return 0;
        }

        self.files_streamed += 1;
        self.bytes_streamed += sent as u32;
        self.transfer_in_progress = false;
        self.current_file.clear();

        debug!("Stream: sent {} ({} bytes)", name, sent);
        sent
    }

    /// Reset any in-progress transfer state and emit the abort marker so
    /// the receiving side knows the frame is dead.
    pub fn abort_transfer(&mut self) {
        if self.transfer_in_progress {
            self.transfer_in_progress = false;
            self.current_file.clear();
            self.send_line("ABORT:Transfer aborted");
        }
    }

    /// Best-effort inbound parse: read a framed hex stream from `reader`
    /// back to binary.  Tolerates the BEGIN/SIZE/END markers, PROGRESS and
    /// ABORT lines, an optional `XXXXXXXX: ` address-prefix column, and
    /// grouping spaces.  Stops at end of input or a full buffer; returns
    /// bytes decoded.
    pub fn receive_file<R: Read>(reader: &mut R, data: &mut [u8]) -> usize {
        let mut received = 0;
        let mut line: heapless::Vec<u8, 256> = heapless::Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let eof = match reader.read(&mut byte) {
                Ok(0) | Err(_) => true,
                Ok(_) => false,
            };

            if eof || byte[0] == b'\r' || byte[0] == b'\n' {
                if !line.is_empty() {
                    received += decode_hex_line(&line, &mut data[received..]);
                    line.clear();
                }
                if eof || received >= data.len() {
                    return received;
                }
            } else if line.len() < 255 {
                let _ = line.push(byte[0]);
            }
        }
    }
}

/// Decode one line of the stream into `out`.  Marker lines decode to
/// nothing; an address prefix column is skipped.
fn decode_hex_line(line: &[u8], out: &mut [u8]) -> usize {
    for marker in [
        b"BEGIN:".as_slice(),
        b"SIZE:",
        b"END:",
        b"PROGRESS:",
        b"ABORT:",
    ] {
        if line.starts_with(marker) {
            return 0;
        }
    }

    // An address prefix ("0001F0: ") is hex digits then ": "; skip past it.
    let mut payload = line;
    if let Some(colon) = line.iter().position(|&b| b == b':') {
        if line[..colon].iter().all(|&b| from_hex_digit(b).is_some()) {
            payload = &line[(colon + 1).min(line.len())..];
        }
    }

    let mut decoded = 0;
    let mut high: Option<u8> = None;
    for &ch in payload {
        if ch == b' ' {
            continue;
        }
        let Some(nibble) = from_hex_digit(ch) else {
            // Not a data line after all.
            return 0;
        };
        match high.take() {
            None => high = Some(nibble),
            Some(h) => {
                if decoded >= out.len() {
                    return decoded;
                }
                out[decoded] = (h << 4) | nibble;
                decoded += 1;
            }
        }
    }
    decoded
}

impl<W: Write> StoragePlugin for StreamStorage<W> {
    fn initialize(&mut self) -> StatusCode {
        if self.initialized {
            return StatusCode::Ok;
        }
        // The serial port is brought up by the platform before any plugin
        // runs; there is nothing to probe.
        self.initialized = true;
        StatusCode::Ok
    }

    fn is_ready(&mut self) -> bool {
        // No physical media to go away - always ready once initialized.
        self.initialized
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Stream
    }

    fn name(&self) -> &'static str {
        "Serial"
    }

    fn available_space(&mut self) -> u32 {
        // Streaming: effectively unbounded.
        u32::MAX
    }

    fn total_space(&mut self) -> u32 {
        u32::MAX
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> usize {
        self.stream_file(name, data)
    }

    fn read_file(&mut self, _name: &str, _buf: &mut [u8]) -> usize {
        // Write-only by design; receive_file exists for the inbound path
        // but there is no file store to read from.
        0
    }

    fn delete_file(&mut self, _name: &str) -> bool {
        false
    }

    fn file_exists(&mut self, _name: &str) -> bool {
        false
    }

    fn file_size(&mut self, _name: &str) -> u32 {
        0
    }

    fn list_files(&mut self, _out: &mut [FileName]) -> usize {
        0
    }

    fn format(&mut self) -> bool {
        // Nothing persisted; treat as resetting the transfer statistics.
        self.reset_transfer_stats();
        true
    }

    fn status_line(&mut self, out: &mut StatusLine) -> bool {
        out.clear();
        let result = if !self.initialized {
            write!(out, "Serial: Not initialized")
        } else if self.transfer_in_progress {
            write!(out, "Serial: Transfer in progress")
        } else {
            write!(out, "Serial: Ready")
        };
        result.is_ok()
    }

    fn validate(&mut self) -> bool {
        self.initialized
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{SliceReader, ready_stream};
    use super::*;

    fn output_of(stream: &mut StreamStorage<mock::VecSink>) -> String {
        String::from_utf8(stream.port_mut().data.clone()).unwrap()
    }

    #[test]
    fn framing_is_exact() {
        let mut stream = ready_stream();
        let data: Vec<u8> = (0..80u8).collect();
        assert_eq!(stream.stream_file("cap.bin", &data), 80);

        let out = output_of(&mut stream);
        let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();

        // Exactly one of each marker, in order, around the data.
        assert_eq!(lines.iter().filter(|l| l.starts_with("BEGIN:")).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.starts_with("SIZE:")).count(), 1);
        assert_eq!(lines.iter().filter(|l| l.starts_with("END:")).count(), 1);
        assert_eq!(lines[0], "BEGIN:cap.bin");
        assert_eq!(lines[1], "SIZE:80");
        assert_eq!(lines[lines.len() - 1], "END:cap.bin");

        // 80 bytes at 32 per line = 3 data lines.
        assert_eq!(lines.len(), 6);

        // Hex-decoding the data lines reconstructs the input exactly.
        let mut decoded = Vec::new();
        for line in &lines[2..lines.len() - 1] {
            let mut buf = [0u8; HEX_BYTES_PER_LINE];
            let n = super::decode_hex_line(line.as_bytes(), &mut buf);
            decoded.extend_from_slice(&buf[..n]);
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn hex_lines_grouped_and_uppercase() {
        let mut stream = ready_stream();
        let data = [0xABu8; 16];
        assert_eq!(stream.stream_file("x.bin", &data), 16);

        let out = output_of(&mut stream);
        // 16 bytes: two 8-byte groups separated by one space.
        assert!(out.contains("ABABABABABABABAB ABABABABABABABAB"));
    }

    #[test]
    fn full_line_has_no_trailing_space() {
        let mut stream = ready_stream();
        let data = [0x00u8; HEX_BYTES_PER_LINE];
        assert_eq!(stream.stream_file("x.bin", &data), 32);

        let out = output_of(&mut stream);
        for line in out.split("\r\n") {
            assert_eq!(line.trim_end(), line);
        }
    }

    #[test]
    fn receive_round_trip() {
        let mut stream = ready_stream();
        let data: Vec<u8> = (0..200u8).collect();
        assert_eq!(stream.stream_file("cap.bin", &data), 200);

        let wire = stream.port_mut().data.clone();
        let mut reader = SliceReader {
            data: &wire,
            pos: 0,
        };
        let mut decoded = [0u8; 256];
        let n = StreamStorage::<mock::VecSink>::receive_file(&mut reader, &mut decoded);
        assert_eq!(n, 200);
        assert_eq!(&decoded[..200], &data[..]);
    }

    #[test]
    fn receive_tolerates_prefixes_and_markers() {
        let wire = b"BEGIN:x.bin\r\n\
                     SIZE:12\r\n\
                     000000: 00010203 04050607\r\n\
                     PROGRESS:x.bin:8/12 (66%)\r\n\
                     000008: 08090A0B\r\n\
                     END:x.bin\r\n";
        let mut reader = SliceReader {
            data: wire,
            pos: 0,
        };
        let mut decoded = [0u8; 32];
        let n = StreamStorage::<mock::VecSink>::receive_file(&mut reader, &mut decoded);
        assert_eq!(n, 12);
        assert_eq!(&decoded[..12], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn progress_lines_when_enabled() {
        let mut stream = ready_stream();
        stream.set_progress_enabled(true);
        let data = vec![0x42u8; 2048];
        assert_eq!(stream.stream_file("big.bin", &data), 2048);

        let out = output_of(&mut stream);
        assert_eq!(out.matches("PROGRESS:big.bin:").count(), 2);
        assert!(out.contains("PROGRESS:big.bin:1024/2048 (50%)"));

        // Progress lines must not confuse a receiver.
        let wire = stream.port_mut().data.clone();
        let mut reader = SliceReader {
            data: &wire,
            pos: 0,
        };
        let mut decoded = vec![0u8; 4096];
        let n = StreamStorage::<mock::VecSink>::receive_file(&mut reader, &mut decoded);
        assert_eq!(n, 2048);
        assert_eq!(&decoded[..2048], &data[..]);
    }

    #[test]
    fn progress_off_by_default() {
        let mut stream = ready_stream();
        let data = vec![0u8; 2048];
        assert_eq!(stream.stream_file("big.bin", &data), 2048);
        assert!(!output_of(&mut stream).contains("PROGRESS:"));
    }

    #[test]
    fn sink_failure_aborts_with_zero() {
        let mut stream = ready_stream();
        stream.port_mut().fail = true;
        assert_eq!(stream.stream_file("x.bin", &[1, 2, 3]), 0);
        assert!(!stream.is_transfer_in_progress());
        assert_eq!(stream.transfer_stats(), (0, 0));
    }

    #[test]
    fn unsupported_operations_fail_cleanly() {
        let mut stream = ready_stream();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read_file("x.bin", &mut buf), 0);
        assert!(!stream.delete_file("x.bin"));
        assert!(!stream.file_exists("x.bin"));
        assert_eq!(stream.file_size("x.bin"), 0);
        let mut names: [FileName; 2] = core::array::from_fn(|_| FileName::new());
        assert_eq!(stream.list_files(&mut names), 0);
    }

    #[test]
    fn stats_accumulate() {
        let mut stream = ready_stream();
        assert_eq!(stream.stream_file("a.bin", &[1, 2, 3]), 3);
        assert_eq!(stream.stream_file("b.bin", &[4, 5]), 2);
        assert_eq!(stream.transfer_stats(), (2, 5));

        stream.reset_transfer_stats();
        assert_eq!(stream.transfer_stats(), (0, 0));
    }

    #[test]
    fn abort_emits_marker_only_mid_transfer() {
        let mut stream = ready_stream();
        stream.abort_transfer();
        assert!(output_of(&mut stream).is_empty());

        stream.transfer_in_progress = true;
        stream.abort_transfer();
        assert!(output_of(&mut stream).contains("ABORT:Transfer aborted"));
        assert!(!stream.is_transfer_in_progress());
    }

    #[test]
    fn always_ready_as_fallback() {
        let mut stream = ready_stream();
        assert!(stream.is_ready());
        assert_eq!(stream.available_space(), u32::MAX);
    }
}
