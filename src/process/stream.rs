//! Interleaved multiplexing of a child's stdout/stderr into one ordered
//! sequence of chunks, plus a thin line-splitter built on top of it.
//!
//! One reader task per stream pushes chunks into a shared `mpsc` channel as
//! soon as the kernel hands them back; the channel itself provides the
//! fairness and ordering guarantee spec.md §4.E asks for — chunks arrive in
//! the order their reader observed them, and bytes within a single stream
//! never reorder relative to each other.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamName,
    pub data: Vec<u8>,
}

impl OutputChunk {
    /// Lossily decodes this chunk's bytes as UTF-8, replacing invalid
    /// sequences — the Rust analogue of the original's `decode=True`.
    pub fn to_utf8_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

async fn read_loop<R>(
    mut reader: R,
    name: StreamName,
    chunk_size: usize,
    tx: mpsc::Sender<OutputChunk>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx
                    .send(OutputChunk {
                        stream: name,
                        data: buf[..n].to_vec(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// A finite, non-restartable, interleaved byte-chunk sequence.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputChunk>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputStream {
    pub fn from_pipes<O, E>(stdout: Option<O>, stderr: Option<E>, chunk_size: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(tokio::spawn(read_loop(
                out,
                StreamName::Stdout,
                chunk_size,
                tx.clone(),
            )));
        }
        if let Some(err) = stderr {
            readers.push(tokio::spawn(read_loop(
                err,
                StreamName::Stderr,
                chunk_size,
                tx.clone(),
            )));
        }
        drop(tx);
        Self { rx, readers }
    }

    /// Wraps a single channel of already-labeled chunks, used for PTY mode
    /// where every chunk is labeled `stdout` (see [`StreamName::Stdout`]).
    pub fn from_single(rx: mpsc::Receiver<OutputChunk>) -> Self {
        Self {
            rx,
            readers: Vec::new(),
        }
    }

    pub async fn next(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        for r in &self.readers {
            r.abort();
        }
    }
}

/// Splits an [`OutputStream`] into complete lines (newline included),
/// emitting each stream's trailing partial line at EOF.
pub struct LineStream {
    inner: OutputStream,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    pending: std::collections::VecDeque<OutputChunk>,
    exhausted: bool,
}

impl LineStream {
    pub fn new(inner: OutputStream) -> Self {
        Self {
            inner,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            pending: std::collections::VecDeque::new(),
            exhausted: false,
        }
    }

    fn buf_for(&mut self, name: StreamName) -> &mut Vec<u8> {
        match name {
            StreamName::Stdout => &mut self.stdout_buf,
            StreamName::Stderr => &mut self.stderr_buf,
        }
    }

    fn drain_complete_lines(&mut self, name: StreamName) {
        loop {
            let buf = self.buf_for(name);
            let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = buf.drain(..=pos).collect();
            self.pending.push_back(OutputChunk {
                stream: name,
                data: line,
            });
        }
    }

    pub async fn next(&mut self) -> Option<OutputChunk> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.exhausted {
                return None;
            }
            match self.inner.next().await {
                Some(chunk) => {
                    self.buf_for(chunk.stream).extend_from_slice(&chunk.data);
                    self.drain_complete_lines(chunk.stream);
                }
                None => {
                    self.exhausted = true;
                    if !self.stdout_buf.is_empty() {
                        self.pending.push_back(OutputChunk {
                            stream: StreamName::Stdout,
                            data: std::mem::take(&mut self.stdout_buf),
                        });
                    }
                    if !self.stderr_buf.is_empty() {
                        self.pending.push_back(OutputChunk {
                            stream: StreamName::Stderr,
                            data: std::mem::take(&mut self.stderr_buf),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// Feeds `data` through an in-memory duplex pipe and returns the read
    /// half, closed for writes once `data` has been flushed — giving an
    /// `AsyncRead` that behaves like a child's stdout/stderr pipe at EOF.
    fn make_reader(data: &'static [u8]) -> DuplexStream {
        let (mut writer, reader) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = writer.write_all(data).await;
            let _ = writer.shutdown().await;
        });
        reader
    }

    #[tokio::test]
    async fn interleaved_stream_preserves_per_stream_prefix() {
        let stdout_data: &[u8] = b"aaa\nbbb\n";
        let stderr_data: &[u8] = b"xxx\nyyy\n";
        let mut stream = OutputStream::from_pipes(
            Some(make_reader(stdout_data)),
            Some(make_reader(stderr_data)),
            4096,
        );

        let mut stdout_acc = Vec::new();
        let mut stderr_acc = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.stream {
                StreamName::Stdout => stdout_acc.extend_from_slice(&chunk.data),
                StreamName::Stderr => stderr_acc.extend_from_slice(&chunk.data),
            }
        }
        assert_eq!(stdout_acc, stdout_data);
        assert_eq!(stderr_acc, stderr_data);
    }

    #[tokio::test]
    async fn line_stream_splits_on_newlines_and_keeps_trailing_partial() {
        let stdout_data: &[u8] = b"line1\nline2\npartial";
        let stream =
            OutputStream::from_pipes(Some(make_reader(stdout_data)), None::<DuplexStream>, 4096);
        let mut lines = LineStream::new(stream);

        let mut collected = Vec::new();
        while let Some(chunk) = lines.next().await {
            collected.push(chunk.data);
        }
        assert_eq!(
            collected,
            vec![b"line1\n".to_vec(), b"line2\n".to_vec(), b"partial".to_vec()]
        );
    }

    #[tokio::test]
    async fn concatenating_emitted_lines_equals_underlying_bytes() {
        let stdout_data: &[u8] = b"a\nbb\nccc\n";
        let stream =
            OutputStream::from_pipes(Some(make_reader(stdout_data)), None::<DuplexStream>, 4096);
        let mut lines = LineStream::new(stream);
        let mut all = Vec::new();
        while let Some(chunk) = lines.next().await {
            all.extend_from_slice(&chunk.data);
        }
        assert_eq!(all, stdout_data);
    }
}
