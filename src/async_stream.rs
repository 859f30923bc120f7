//! Async adapter.
//!
//! `AsyncSerialStream` runs the blocking stream API on tokio's blocking
//! pool, so a read waiting out its timeout never stalls the runtime.

use crate::error::{StreamError, StreamResult};
use crate::events::{SerialEvent, SubscriptionId};
use crate::stream::{RuntimeOptions, SerialStream, StreamOptions};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

fn join_error(err: tokio::task::JoinError) -> StreamError {
    StreamError::Io(std::io::Error::other(err))
}

/// Async wrapper around a shared [`SerialStream`].
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct AsyncSerialStream {
    inner: Arc<SerialStream>,
}

impl AsyncSerialStream {
    pub fn new(stream: SerialStream) -> Self {
        Self {
            inner: Arc::new(stream),
        }
    }

    /// Open a named port on the blocking pool.
    ///
    /// # Example
    /// ```no_run
    /// use serial_stream::{AsyncSerialStream, StreamOptions};
    ///
    /// # async fn example() -> serial_stream::StreamResult<()> {
    /// let port = AsyncSerialStream::open("/dev/ttyUSB0", StreamOptions::default()).await?;
    /// port.write(b"ping".to_vec()).await?;
    /// let reply = port.read(64).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(port_name: &str, options: StreamOptions) -> StreamResult<Self> {
        Self::open_with_runtime(port_name, options, RuntimeOptions::default()).await
    }

    /// Open a named port with the completion and monitor threads sized by `runtime`.
    pub async fn open_with_runtime(
        port_name: &str,
        options: StreamOptions,
        runtime: RuntimeOptions,
    ) -> StreamResult<Self> {
        let port_name = port_name.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            SerialStream::open_with_runtime(&port_name, &options, &runtime)
        })
        .await
        .map_err(join_error)??;
        Ok(Self::new(stream))
    }

    /// The wrapped stream, for configuration and line queries.
    pub fn stream(&self) -> &SerialStream {
        &self.inner
    }

    async fn run<T, F>(&self, call: F) -> StreamResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SerialStream) -> StreamResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(join_error)?
    }

    /// Read up to `max` bytes under the stream's read timeout.
    pub async fn read(&self, max: usize) -> StreamResult<Vec<u8>> {
        self.run(move |stream| {
            let mut buf = vec![0u8; max];
            let n = stream.read(&mut buf, 0, max)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }

    pub async fn write(&self, data: Vec<u8>) -> StreamResult<()> {
        self.run(move |stream| stream.write(&data, 0, data.len()))
            .await
    }

    pub async fn flush(&self) -> StreamResult<()> {
        self.run(SerialStream::flush).await
    }

    pub async fn close(&self) -> StreamResult<()> {
        self.run(SerialStream::close).await
    }

    /// Receive notifications through a channel.
    ///
    /// The observer is removed when the receiver is dropped.
    pub fn events(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.subscribe(move |event| {
            let _ = tx.send(event);
        });
        EventReceiver {
            rx,
            id,
            stream: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for AsyncSerialStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSerialStream")
            .field("stream", &self.inner)
            .finish()
    }
}

/// Notification channel returned by [`AsyncSerialStream::events`].
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<SerialEvent>,
    id: SubscriptionId,
    stream: Arc<SerialStream>,
}

impl EventReceiver {
    /// Wait for the next notification. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<SerialEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SerialEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.stream.unsubscribe(self.id);
    }
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver").field("id", &self.id).finish()
    }
}
