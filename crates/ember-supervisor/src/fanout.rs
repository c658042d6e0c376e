use std::{
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    task::JoinHandle,
};

use crate::{config::Encoding, observer::Observer};

/// A line longer than `buffer_len * LINE_LIMIT_FACTOR` bytes is delivered in pieces.
pub const LINE_LIMIT_FACTOR: usize = 64;

/// Copy-on-write list of observers for one stream.
///
/// Registration swaps in a new vector; delivery works on the snapshot taken for the
/// current line, so appends never disturb an in-flight delivery.
#[derive(Default)]
pub struct ObserverList {
    inner: RwLock<Arc<Vec<Arc<dyn Observer>>>>,
}

impl ObserverList {
    pub fn new(initial: impl IntoIterator<Item = Arc<dyn Observer>>) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial.into_iter().collect())),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(observer);
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Observer>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deliver(&self, line: &str) {
        for observer in self.snapshot().iter() {
            observer.on_line(line);
        }
    }
}

/// Background task pumping one process stream into its observers, line by line.
///
/// Memory per reader is bounded: a line that grows past the limit without a newline is
/// cut there and the remainder arrives as the following line(s).
pub struct OutputReader {
    name: String,
    observers: Arc<ObserverList>,
    delivered: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutputReader {
    pub fn spawn<R>(
        name: impl Into<String>,
        stream: R,
        observers: Arc<ObserverList>,
        encoding: Encoding,
        buffer_len: usize,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = name.into();
        let delivered = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn({
            let name = name.clone();
            let observers = observers.clone();
            let delivered = delivered.clone();
            async move {
                let buffer_len = buffer_len.max(1);
                let line_limit = buffer_len.saturating_mul(LINE_LIMIT_FACTOR) as u64;
                let mut reader = BufReader::with_capacity(buffer_len, stream);
                let mut buf = Vec::with_capacity(buffer_len);
                loop {
                    buf.clear();
                    let read = (&mut reader).take(line_limit).read_until(b'\n', &mut buf).await;
                    match read {
                        Ok(0) => break,
                        Ok(_) => {
                            if buf.last() == Some(&b'\n') {
                                buf.pop();
                                if buf.last() == Some(&b'\r') {
                                    buf.pop();
                                }
                            }
                            let line = encoding.decode(&buf);
                            observers.deliver(&line);
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::error!(stream = %name, error = %e, "output reader failed");
                            break;
                        }
                    }
                }
                tracing::debug!(stream = %name, "output reader finished");
            }
        });

        Self {
            name,
            observers,
            delivered,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        self.observers.register(observer);
    }

    pub fn observers(&self) -> &Arc<ObserverList> {
        &self.observers
    }

    pub fn lines_delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|t| t.is_finished())
    }

    /// Waits for the reader to hit end-of-stream. Aborts it and returns false on timeout.
    pub async fn join(&self, timeout: Duration) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return true;
        };

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(stream = %self.name, "output reader did not finish in time; aborting");
                task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::LineBuffer;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn delivers_lines_in_order_to_every_observer() {
        let a = Arc::new(LineBuffer::default());
        let b = Arc::new(LineBuffer::default());
        let list = Arc::new(ObserverList::new([
            a.clone() as Arc<dyn Observer>,
            b.clone() as Arc<dyn Observer>,
        ]));

        let input: &[u8] = b"one\r\ntwo\nthree";
        let reader = OutputReader::spawn("stdout", input, list, Encoding::Utf8, 4);
        assert!(reader.join(Duration::from_secs(5)).await);

        assert_eq!(a.lines(), vec!["one", "two", "three"]);
        assert_eq!(b.lines(), a.lines());
        assert_eq!(reader.lines_delivered(), 3);
        assert!(reader.join(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn late_registration_sees_following_lines() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let early = Arc::new(LineBuffer::default());
        let reader = OutputReader::spawn(
            "stderr",
            rx,
            Arc::new(ObserverList::new([early.clone() as Arc<dyn Observer>])),
            Encoding::Utf8,
            64,
        );

        tx.write_all(b"first\n").await.unwrap();
        while reader.lines_delivered() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let late = Arc::new(LineBuffer::default());
        reader.register(late.clone());
        tx.write_all(b"second\n").await.unwrap();
        drop(tx);

        assert!(reader.join(Duration::from_secs(5)).await);
        assert_eq!(early.lines(), vec!["first", "second"]);
        assert_eq!(late.lines(), vec!["second"]);
    }

    #[tokio::test]
    async fn endless_line_is_cut_at_the_limit() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let buf = Arc::new(LineBuffer::default());
        let reader = OutputReader::spawn(
            "stdout",
            rx,
            Arc::new(ObserverList::new([buf.clone() as Arc<dyn Observer>])),
            Encoding::Utf8,
            2,
        );
        let limit = 2 * LINE_LIMIT_FACTOR;

        // No newline and the stream stays open: pieces must still arrive.
        tx.write_all(&vec![b'x'; limit * 3]).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while reader.lines_delivered() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reader.lines_delivered(), 3);

        tx.write_all(b"tail\n").await.unwrap();
        drop(tx);
        assert!(reader.join(Duration::from_secs(5)).await);

        let lines = buf.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[..3].iter().all(|l| l.len() == limit));
        assert_eq!(lines[3], "tail");
    }

    #[tokio::test]
    async fn join_times_out_on_open_stream() {
        let (_tx, rx) = tokio::io::duplex(8);
        let reader = OutputReader::spawn(
            "stdout",
            rx,
            Arc::new(ObserverList::default()),
            Encoding::Utf8,
            8,
        );
        assert!(!reader.join(Duration::from_millis(20)).await);
        assert!(reader.is_finished());
    }

    #[test]
    fn registration_during_delivery_keeps_snapshot_stable() {
        let list = Arc::new(ObserverList::default());
        let buf = Arc::new(LineBuffer::default());
        list.register(buf.clone());
        let snap = list.snapshot();
        list.register(Arc::new(LineBuffer::default()));
        assert_eq!(snap.len(), 1);
        assert_eq!(list.len(), 2);
    }
}
