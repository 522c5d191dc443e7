//! Offline transport over a binary capture, e.g. an OSPF API byte dump.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{Credentials, Direction, Framing, TranscriptLog, Transport};
use crate::error::ProtocolError;

/// Reads fixed-size or length-prefixed pieces from a file. The end of the
/// file reports `Closed`; a piece cut short by the end of the file is
/// `MalformedIo`.
pub struct DumpTransport {
    path: PathBuf,
    data: Vec<u8>,
    position: usize,
    connected: bool,
    log: TranscriptLog,
}

impl DumpTransport {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Vec::new(),
            position: 0,
            connected: false,
            log: TranscriptLog::default(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

#[async_trait]
impl Transport for DumpTransport {
    fn target(&self) -> String {
        self.path.display().to_string()
    }

    async fn connect(&mut self, _credentials: &Credentials) -> Result<(), ProtocolError> {
        self.data = tokio::fs::read(&self.path).await.map_err(|err| {
            ProtocolError::Network(format!(
                "Problem opening file {}: {err}",
                self.path.display()
            ))
        })?;
        self.position = 0;
        self.connected = true;
        debug!("Loaded {} bytes from {}", self.data.len(), self.path.display());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        self.data.clear();
        self.position = 0;
        self.connected = false;
        Ok(())
    }

    /// A capture cannot be talked to; outgoing bytes are only logged.
    async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.log.write(Direction::Input, data);
        debug!("Ignoring {} bytes sent to dump {}", data.len(), self.target());
        Ok(())
    }

    async fn receive(
        &mut self,
        framing: &Framing,
        _timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Err(ProtocolError::Closed(format!("end of dump {}", self.target())));
        }
        let len = match framing {
            Framing::Exact(len) => *len,
            Framing::LengthPrefixed { header, length_at } => {
                let rest = &self.data[self.position..];
                match Framing::prefixed_len(*header, *length_at, rest) {
                    Some(total) => total,
                    None => {
                        return Err(ProtocolError::MalformedIo(format!(
                            "expecting header of length {header} from {}, got {remaining}",
                            self.target()
                        )));
                    }
                }
            }
            Framing::Delimited(_) => {
                return Err(ProtocolError::MalformedIo(format!(
                    "dump {} only supports sized reads",
                    self.target()
                )));
            }
        };
        if remaining < len {
            return Err(ProtocolError::MalformedIo(format!(
                "expecting {len} bytes from {}, got {remaining}",
                self.target()
            )));
        }
        let chunk = self.data[self.position..self.position + len].to_vec();
        self.position += len;
        self.log.write(Direction::Output, &chunk);
        Ok(chunk)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn attach_log(&mut self, log: TranscriptLog) {
        self.log = log;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_pieces_until_end_of_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[1, 2, 3, 4, 5, 6]).expect("write");
        let mut dump = DumpTransport::open(file.path());
        dump.connect(&Credentials::default()).await.expect("open");

        let timeout = Duration::from_secs(1);
        assert_eq!(
            dump.receive(&Framing::Exact(4), timeout).await.expect("piece"),
            [1, 2, 3, 4]
        );
        let err = dump
            .receive(&Framing::Exact(4), timeout)
            .await
            .expect_err("truncated");
        assert!(matches!(err, ProtocolError::MalformedIo(_)));
        assert_eq!(
            dump.receive(&Framing::Exact(2), timeout).await.expect("piece"),
            [5, 6]
        );
        let err = dump
            .receive(&Framing::Exact(2), timeout)
            .await
            .expect_err("end");
        assert!(matches!(err, ProtocolError::Closed(_)));
    }

    #[tokio::test]
    async fn length_prefixed_pieces_follow_their_headers() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[1, 1, 0, 2, 0xaa, 0xbb, 1, 1, 0, 0, 1, 1, 0, 9, 0xcc])
            .expect("write");
        let mut dump = DumpTransport::open(file.path());
        dump.connect(&Credentials::default()).await.expect("open");

        let framing = Framing::LengthPrefixed {
            header: 4,
            length_at: 2,
        };
        let timeout = Duration::from_secs(1);
        assert_eq!(
            dump.receive(&framing, timeout).await.expect("frame"),
            [1, 1, 0, 2, 0xaa, 0xbb]
        );
        assert_eq!(
            dump.receive(&framing, timeout).await.expect("header only"),
            [1, 1, 0, 0]
        );
        let err = dump
            .receive(&framing, timeout)
            .await
            .expect_err("body cut short");
        assert!(matches!(err, ProtocolError::MalformedIo(_)));
        assert_eq!(dump.remaining(), 5);
    }
}
