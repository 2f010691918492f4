//! Newline-delimited framing for the emulator protocol.
//!
//! A single socket read may carry half a line, or several lines. The
//! decoder buffers bytes until a `\n` arrives, splits on the first one and
//! leaves the remainder in the buffer for the next read.
//!
//! Lines that do not parse are logged and skipped: a malformed line must
//! never tear down the session.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::PilotError;
use crate::protocol::{Inbound, Outbound};

/// Longest line accepted before the buffer is discarded.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct EmulatorCodec {
    /// Bytes already scanned for a terminator, so rescans start past them.
    scanned: usize,
    /// Set after an oversized line: drop bytes up to the next terminator.
    discarding: bool,
}

impl EmulatorCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the next complete line out of `src`, if any.
    fn next_line(&mut self, src: &mut BytesMut) -> Option<String> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            match newline {
                Some(offset) => {
                    let end = self.scanned + offset;
                    self.scanned = 0;
                    let line = src.split_to(end + 1);
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line[..end]);
                    return Some(text.trim_end_matches('\r').to_string());
                }
                None if src.len() > MAX_LINE_LENGTH => {
                    warn!(
                        buffered = src.len(),
                        "line exceeds {MAX_LINE_LENGTH} bytes; discarding"
                    );
                    src.advance(src.len());
                    self.scanned = 0;
                    self.discarding = true;
                    return None;
                }
                None => {
                    self.scanned = src.len();
                    return None;
                }
            }
        }
    }
}

impl Decoder for EmulatorCodec {
    type Item = Inbound;
    type Error = PilotError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.next_line(src) {
            if line.trim().is_empty() {
                continue;
            }
            match Inbound::parse(&line) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => warn!("dropping message: {e}"),
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if !src.is_empty() {
            warn!(bytes = src.len(), "connection closed mid-line; dropping partial message");
            src.clear();
            self.scanned = 0;
        }
        Ok(None)
    }
}

impl Encoder<Outbound> for EmulatorCodec {
    type Error = PilotError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.to_string();
        dst.reserve(text.len() + 1);
        dst.extend_from_slice(text.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ButtonCommand;

    #[test]
    fn partial_line_across_reads() {
        let mut codec = EmulatorCodec::new();
        let mut buf = BytesMut::from("read");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"y\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Ready));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn several_lines_in_one_read_keep_remainder() {
        let mut codec = EmulatorCodec::new();
        let mut buf = BytesMut::from("ready\r\nconfig_loaded\nstate||1||2");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Ready));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::ConfigLoaded));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"state||1||2");
    }

    #[test]
    fn unknown_lines_are_skipped() {
        let mut codec = EmulatorCodec::new();
        let mut buf = BytesMut::from("bogus\nscreenshot_with_state||p||1\n\nready\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Ready));
    }

    #[test]
    fn oversized_line_is_discarded() {
        let mut codec = EmulatorCodec::new();
        let mut buf = BytesMut::from(vec![b'x'; MAX_LINE_LENGTH + 1].as_slice());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        // The tail of the oversized line is dropped too.
        buf.extend_from_slice(b"xxxx\nready\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Ready));
    }

    #[test]
    fn encodes_with_terminator() {
        let mut codec = EmulatorCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Outbound::RequestScreenshot, &mut buf).unwrap();
        codec
            .encode(
                Outbound::Buttons(ButtonCommand::from_names(&["A"], None)),
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"request_screenshot\n0|2\n");
    }

    #[tokio::test]
    async fn framed_over_scripted_socket() {
        use crate::protocol::Button;
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let socket = tokio_test::io::Builder::new()
            .read(b"rea")
            .read(b"dy\nbogus\nconfig_")
            .read(b"loaded\n")
            .write(b"6|2\n")
            .build();
        let mut framed = Framed::new(socket, EmulatorCodec::new());
        assert_eq!(framed.next().await.unwrap().unwrap(), Inbound::Ready);
        assert_eq!(framed.next().await.unwrap().unwrap(), Inbound::ConfigLoaded);
        framed
            .send(Outbound::Buttons(ButtonCommand::single(Button::Up)))
            .await
            .unwrap();
    }
}
