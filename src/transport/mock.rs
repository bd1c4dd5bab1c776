// MIT License - Copyright (c) 2021 TJForc
// In-memory modem for tests and dry runs

use std::collections::VecDeque;

use crate::constants::CTRL_Z;
use crate::error::Result;
use crate::transport::SerialChannel;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>>>;

struct Rule {
    prefix: Vec<u8>,
    responder: Responder,
}

/// A scripted modem that answers complete command lines.
///
/// Written bytes are split into segments at `\r\n` and at Ctrl-Z. Each
/// non-empty segment is matched against the rules in registration order by
/// byte prefix; the first match queues its reply chunks for reading.
/// Segments with no matching rule get no reply (silence), which is also
/// what an unresponsive modem looks like.
///
/// Each `read_available` call returns at most one queued chunk, so a reply
/// split into several chunks is read back in several reads.
#[derive(Default)]
pub struct ScriptedModem {
    rules: Vec<Rule>,
    rx: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    writes: Vec<Vec<u8>>,
    segments: Vec<Vec<u8>>,
}

impl ScriptedModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `prefix` with `reply`.
    pub fn on(self, prefix: impl AsRef<[u8]>, reply: &[u8]) -> Self {
        let reply = reply.to_vec();
        self.on_with(prefix, move |_| vec![reply.clone()])
    }

    /// Always answer `prefix` with the given chunks, read back one per read.
    pub fn on_chunks(self, prefix: impl AsRef<[u8]>, chunks: Vec<Vec<u8>>) -> Self {
        self.on_with(prefix, move |_| chunks.clone())
    }

    /// Answer successive matches with successive replies, repeating the last.
    pub fn on_sequence(self, prefix: impl AsRef<[u8]>, replies: Vec<Vec<u8>>) -> Self {
        let mut replies: VecDeque<Vec<u8>> = replies.into();
        self.on_with(prefix, move |_| {
            let reply = if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            };
            reply.into_iter().collect()
        })
    }

    /// Compute the reply from the matched segment.
    pub fn on_with<F>(mut self, prefix: impl AsRef<[u8]>, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + 'static,
    {
        self.rules.push(Rule {
            prefix: prefix.as_ref().to_vec(),
            responder: Box::new(responder),
        });
        self
    }

    /// Queue bytes the modem emits without being asked.
    pub fn push_unsolicited(&mut self, data: &[u8]) {
        self.rx.push_back(data.to_vec());
    }

    /// Every `write` call, verbatim.
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Every complete segment seen, in order.
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Number of segments starting with `prefix`.
    pub fn count(&self, prefix: impl AsRef<[u8]>) -> usize {
        let prefix = prefix.as_ref();
        self.segments.iter().filter(|s| s.starts_with(prefix)).count()
    }

    fn dispatch(&mut self, segment: Vec<u8>) {
        if segment.is_empty() {
            return;
        }
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|rule| segment.starts_with(&rule.prefix))
        {
            let chunks = (rule.responder)(&segment);
            self.rx.extend(chunks.into_iter().filter(|c| !c.is_empty()));
        }
        self.segments.push(segment);
    }

    fn split_pending(&mut self) {
        loop {
            let crlf = self.pending.windows(2).position(|w| w == b"\r\n");
            let ctrl_z = self.pending.iter().position(|&b| b == CTRL_Z);
            let (end, skip) = match (crlf, ctrl_z) {
                (Some(c), Some(z)) if z < c => (z, 1),
                (Some(c), _) => (c, 2),
                (None, Some(z)) => (z, 1),
                (None, None) => break,
            };
            let segment: Vec<u8> = self.pending.drain(..end + skip).take(end).collect();
            self.dispatch(segment);
        }
    }
}

impl SerialChannel for ScriptedModem {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writes.push(data.to_vec());
        self.pending.extend_from_slice(data);
        self.split_pending();
        Ok(())
    }

    async fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let Some(front) = self.rx.front_mut() else {
            return Ok(Vec::new());
        };
        if front.len() <= max {
            return Ok(self.rx.pop_front().unwrap_or_default());
        }
        let rest = front.split_off(max);
        Ok(std::mem::replace(front, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_segments_split_on_crlf_and_ctrl_z() {
        let mut modem = ScriptedModem::new()
            .on("GET ", b"HTTP/1.0 200 OK\r\n")
            .on([0x1Bu8], b"ntp");
        modem.write(b"GET /a HTTP/1.0\r\n").await.unwrap();
        modem.write(b"\r\n\r\n\x1a").await.unwrap();
        modem.write(&[0x1B, 0, 0, CTRL_Z]).await.unwrap();

        assert_eq!(modem.count("GET "), 1);
        assert_eq!(modem.segments().len(), 2);
        assert_eq!(modem.read_available(64).await.unwrap(), b"HTTP/1.0 200 OK\r\n");
        assert_eq!(modem.read_available(64).await.unwrap(), b"ntp");
        assert!(modem.read_available(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_respects_max() {
        let mut modem = ScriptedModem::new();
        modem.push_unsolicited(b"abcdef");
        assert_eq!(modem.read_available(4).await.unwrap(), b"abcd");
        assert_eq!(modem.read_available(4).await.unwrap(), b"ef");
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let mut modem =
            ScriptedModem::new().on_sequence("x", vec![b"1".to_vec(), b"2".to_vec()]);
        for _ in 0..3 {
            modem.write(b"x\r\n").await.unwrap();
        }
        assert_eq!(modem.read_available(8).await.unwrap(), b"1");
        assert_eq!(modem.read_available(8).await.unwrap(), b"2");
        assert_eq!(modem.read_available(8).await.unwrap(), b"2");
    }
}
