use crate::types::{OutputRecord, OutputSource};

use bytes::BytesMut;
use chrono::Utc;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

#[derive(Default)]
struct OutputLog {
    records: Vec<Arc<OutputRecord>>,
    closed: bool,
}

/// Fans one job's output out to any number of readers.
///
/// Every record ever appended is retained, so a reader that subscribes late (even after the
/// job is gone) still replays from sequence 0. Readers only hold a cursor into the shared log.
/// The `watch` channel doubles as the wake-up primitive: every append or close bumps its
/// version, which wakes all readers parked in `OutputReader::next`.
///
/// Appending never waits on readers.
#[derive(Clone)]
pub struct Broadcaster {
    log: Arc<watch::Sender<OutputLog>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (log, _) = watch::channel(OutputLog::default());
        Self { log: Arc::new(log) }
    }

    /// Append one record. Ignored once the log is closed.
    pub fn append(&self, source: OutputSource, text: String) {
        self.log.send_modify(|log| {
            if log.closed {
                return;
            }
            let seq = log.records.len() as u64;
            log.records.push(Arc::new(OutputRecord {
                seq,
                source,
                timestamp: Utc::now(),
                text,
            }));
        });
    }

    /// Mark end-of-stream. Readers drain what is left and then see `None` forever.
    pub fn close(&self) {
        self.log.send_if_modified(|log| !std::mem::replace(&mut log.closed, true));
    }

    /// Create an independent reader positioned at sequence 0.
    pub fn subscribe(&self) -> OutputReader {
        OutputReader {
            log: self.log.subscribe(),
            cursor: 0,
        }
    }

    /// Split `stream` into newline-delimited records tagged with `source`, until EOF.
    ///
    /// A trailing fragment without a newline is flushed as a final record. Invalid UTF-8 is
    /// replaced lossily.
    pub async fn capture<R>(&self, mut stream: R, source: OutputSource)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match stream.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line = buf.split_to(pos + 1);
                        self.append(source, String::from_utf8_lossy(&line[..pos]).into_owned());
                    }
                }
                Ok(_) => break,
                Err(err) => {
                    tracing::debug!(%source, error = %err, "output stream read failed");
                    break;
                }
            }
        }
        if !buf.is_empty() {
            self.append(source, String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

/// A private cursor over a `Broadcaster`'s log.
///
/// Dropping a reader has no effect on the job or on other readers.
pub struct OutputReader {
    log: watch::Receiver<OutputLog>,
    cursor: usize,
}

impl OutputReader {
    /// Next record in capture order, or `None` once the log is closed and fully read.
    ///
    /// Waits while the reader is caught up with an open log.
    pub async fn next(&mut self) -> Option<Arc<OutputRecord>> {
        loop {
            {
                let log = self.log.borrow_and_update();
                if let Some(record) = log.records.get(self.cursor) {
                    self.cursor += 1;
                    return Some(record.clone());
                }
                if log.closed {
                    return None;
                }
            }
            if self.log.changed().await.is_err() {
                // writer side is gone; drain anything that landed before it went away
                let log = self.log.borrow();
                let record = log.records.get(self.cursor).cloned();
                if record.is_some() {
                    self.cursor += 1;
                }
                return record;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn drain(mut reader: OutputReader) -> Vec<Arc<OutputRecord>> {
        let mut out = vec![];
        while let Some(record) = reader.next().await {
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn late_subscriber_replays_from_start() {
        let broadcaster = Broadcaster::new();
        broadcaster.append(OutputSource::Stdout, "one".into());
        broadcaster.append(OutputSource::Stderr, "two".into());
        broadcaster.close();

        let records = drain(broadcaster.subscribe()).await;
        let texts: Vec<_> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["one", "two"]);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].seq, 1);
        assert_eq!(records[1].source, OutputSource::Stderr);
    }

    #[tokio::test]
    async fn end_of_stream_is_permanent() {
        let broadcaster = Broadcaster::new();
        broadcaster.close();
        broadcaster.append(OutputSource::Stdout, "too late".into());
        let mut reader = broadcaster.subscribe();
        assert!(reader.next().await.is_none());
        assert!(reader.next().await.is_none());
        assert!(broadcaster.subscribe().next().await.is_none());
    }

    #[tokio::test]
    async fn waiting_reader_wakes_on_append_and_close() {
        let broadcaster = Broadcaster::new();
        let reader = broadcaster.subscribe();
        let handle = tokio::spawn(drain(reader));

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster.append(OutputSource::Stdout, "late".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster.close();

        let records = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reader never woke up")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "late");
    }

    #[tokio::test]
    async fn concurrent_readers_agree_on_order() {
        let broadcaster = Broadcaster::new();
        let early: Vec<_> = (0..4)
            .map(|_| tokio::spawn(drain(broadcaster.subscribe())))
            .collect();

        let writer = broadcaster.clone();
        let producer = tokio::spawn(async move {
            for i in 0..200 {
                let source = if i % 3 == 0 {
                    OutputSource::Stderr
                } else {
                    OutputSource::Stdout
                };
                writer.append(source, format!("line {}", i));
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            writer.close();
        });
        producer.await.unwrap();

        let late = drain(broadcaster.subscribe()).await;
        assert_eq!(late.len(), 200);
        for (i, record) in late.iter().enumerate() {
            assert_eq!(record.seq, i as u64);
        }
        for handle in early {
            let records = handle.await.unwrap();
            assert_eq!(records, late);
        }
    }

    #[tokio::test]
    async fn dropped_writer_ends_stream() {
        let broadcaster = Broadcaster::new();
        broadcaster.append(OutputSource::Stdout, "only".into());
        let reader = broadcaster.subscribe();
        drop(broadcaster);
        let records = drain(reader).await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn capture_splits_lines_and_flushes_fragment() {
        let broadcaster = Broadcaster::new();
        let (mut tx, rx) = tokio::io::duplex(64);
        let capture = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.capture(rx, OutputSource::Stdout).await })
        };

        tx.write_all(b"hello world\nsec").await.unwrap();
        tx.write_all(b"ond\n\ntail").await.unwrap();
        drop(tx);
        capture.await.unwrap();
        broadcaster.close();

        let texts: Vec<_> = drain(broadcaster.subscribe())
            .await
            .iter()
            .map(|r| r.text.clone())
            .collect();
        assert_eq!(texts, ["hello world", "second", "", "tail"]);
    }

    #[tokio::test]
    async fn capture_replaces_invalid_utf8() {
        let broadcaster = Broadcaster::new();
        let input: &[u8] = b"ok\xff\n";
        broadcaster.capture(input, OutputSource::Stderr).await;
        broadcaster.close();
        let records = drain(broadcaster.subscribe()).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].text.starts_with("ok"));
        assert_eq!(records[0].source, OutputSource::Stderr);
    }
}
