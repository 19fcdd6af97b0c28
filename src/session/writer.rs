//! Shell write dispatcher
//!
//! Callers enqueue and return immediately; one consumer task owns the
//! shell's stdin and performs every write, flush and close in submission
//! order.

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::events::DisconnectSignal;
use crate::ssh::engine::ShellInput;
use crate::ssh::SshError;

#[derive(Debug)]
enum WriteItem {
    Bytes(Bytes),
    Byte(u8),
    Flush,
    Close,
}

/// Single-consumer queue in front of a shell's stdin
pub struct WriteDispatcher {
    tx: mpsc::UnboundedSender<WriteItem>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteDispatcher {
    /// Start the consumer. A write failure that a flush cannot recover
    /// fires `disconnect` and stops consuming; later items are dropped.
    pub fn spawn(input: Box<dyn ShellInput>, disconnect: DisconnectSignal) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(consume(input, rx, disconnect));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.submit(WriteItem::Bytes(Bytes::copy_from_slice(data)))
    }

    pub fn write_byte(&self, byte: u8) -> Result<(), SshError> {
        self.submit(WriteItem::Byte(byte))
    }

    pub fn flush(&self) -> Result<(), SshError> {
        self.submit(WriteItem::Flush)
    }

    /// Queue the close sentinel; items already queued are written first
    pub fn close(&self) -> Result<(), SshError> {
        self.submit(WriteItem::Close)
    }

    /// Wait for the consumer to finish. Returns once the close sentinel
    /// has been handled or the consumer stopped on a write failure.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn submit(&self, item: WriteItem) -> Result<(), SshError> {
        self.tx.send(item).map_err(|_| SshError::StreamClosed)
    }
}

async fn consume(
    mut input: Box<dyn ShellInput>,
    mut rx: mpsc::UnboundedReceiver<WriteItem>,
    disconnect: DisconnectSignal,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            WriteItem::Bytes(data) => input.write(&data).await,
            WriteItem::Byte(byte) => input.write(&[byte]).await,
            WriteItem::Flush => input.flush().await,
            WriteItem::Close => {
                if let Err(e) = input.close().await {
                    debug!("Closing shell input failed: {}", e);
                }
                break;
            }
        };

        if let Err(e) = result {
            warn!("Shell write failed: {}", e);
            if let Err(e) = input.flush().await {
                warn!("Flush after failed write also failed: {}", e);
                disconnect.fire(false, format!("Write to remote failed: {}", e));
                break;
            }
        }
    }
    debug!("Write dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    use crate::ssh::engine::StreamInput;

    #[tokio::test]
    async fn test_concurrent_writers_keep_submission_order() {
        let (ours, mut theirs) = tokio::io::duplex(1 << 16);
        let (signal, _rx) = DisconnectSignal::new();
        let dispatcher = Arc::new(WriteDispatcher::spawn(Box::new(StreamInput(ours)), signal));

        // Submissions are serialized through one lock so the order is known
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for worker in 0..4u8 {
            let dispatcher = dispatcher.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    let mut order = order.lock();
                    let byte = worker * 50 + i;
                    dispatcher.write_byte(byte).unwrap();
                    order.push(byte);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        dispatcher.close().unwrap();
        dispatcher.join().await;

        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, *order.lock());
        assert_eq!(wire.len(), 200);
    }

    #[tokio::test]
    async fn test_close_stops_consumer() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (signal, _rx) = DisconnectSignal::new();
        let dispatcher = WriteDispatcher::spawn(Box::new(StreamInput(ours)), signal);

        dispatcher.write(b"exit\n").unwrap();
        dispatcher.flush().unwrap();
        dispatcher.close().unwrap();

        let mut wire = Vec::new();
        theirs.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, b"exit\n");

        // consumer is gone; further writes are refused
        tokio::task::yield_now().await;
        let task_done = async {
            while dispatcher.write(b"late").is_ok() {
                tokio::task::yield_now().await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), task_done)
            .await
            .unwrap();
    }

    /// Fails writes from the `fail_from`-th call on; flush fails if asked to
    struct FlakyInput {
        written: Arc<Mutex<Vec<u8>>>,
        calls: usize,
        fail_from: usize,
        flush_fails: bool,
    }

    #[async_trait]
    impl ShellInput for FlakyInput {
        async fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.calls += 1;
            if self.calls >= self.fail_from {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
            }
            self.written.lock().extend_from_slice(data);
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            if self.flush_fails {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            } else {
                Ok(())
            }
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unrecoverable_write_fires_disconnect_and_drops_rest() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let input = FlakyInput {
            written: written.clone(),
            calls: 0,
            fail_from: 2,
            flush_fails: true,
        };
        let (signal, mut rx) = DisconnectSignal::new();
        let dispatcher = WriteDispatcher::spawn(Box::new(input), signal.clone());

        dispatcher.write(b"a").unwrap();
        dispatcher.write(b"b").unwrap();
        let _ = dispatcher.write(b"c");

        let notice = rx.recv().await.unwrap();
        assert!(!notice.clean);
        assert!(notice.reason.starts_with("Write to remote failed"));
        dispatcher.join().await;
        assert_eq!(*written.lock(), b"a");
    }

    #[tokio::test]
    async fn test_recovered_write_keeps_consuming() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let input = FlakyInput {
            written: written.clone(),
            calls: 0,
            fail_from: 2,
            flush_fails: false,
        };
        let (signal, _rx) = DisconnectSignal::new();
        let dispatcher = WriteDispatcher::spawn(Box::new(input), signal.clone());

        dispatcher.write(b"a").unwrap();
        dispatcher.write(b"b").unwrap();
        dispatcher.close().unwrap();
        dispatcher.join().await;
        assert!(!signal.has_fired());
    }
}
