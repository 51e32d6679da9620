//! Bounded push adapter over [`Consumer::poll_batch`].

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Consumer, ConsumerRecord};
use crate::error::{Error, Result};

/// Records pushed by a background poll task.
///
/// The task polls only while the channel has room, so a slow reader
/// throttles fetching. Dropping the stream stops the task, which then
/// closes the consumer (leaving its group).
///
/// ```rust,no_run
/// use futures::StreamExt;
/// # async fn example(consumer: kafkaesque_client::consumer::Consumer) {
/// let mut stream = consumer.into_stream(1024);
/// while let Some(record) = stream.next().await {
///     match record {
///         Ok(record) => println!("{}@{}", record.topic_partition(), record.offset),
///         Err(e) => eprintln!("poll failed: {e}"),
///     }
/// }
/// # }
/// ```
pub struct RecordStream {
    rx: mpsc::Receiver<Result<ConsumerRecord>>,
    task: JoinHandle<()>,
}

impl RecordStream {
    pub(crate) fn spawn(consumer: Consumer, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(pump(consumer, tx));
        Self { rx, task }
    }

    /// Stop polling and wait for the consumer to close.
    pub async fn close(mut self) {
        self.rx.close();
        let _ = (&mut self.task).await;
    }
}

impl Stream for RecordStream {
    type Item = Result<ConsumerRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn pump(mut consumer: Consumer, tx: mpsc::Sender<Result<ConsumerRecord>>) {
    let timeout = consumer.config().fetch_max_wait();
    'outer: loop {
        let batch = tokio::select! {
            _ = tx.closed() => break,
            batch = consumer.poll_batch(timeout) => batch,
        };

        match batch {
            Ok(records) => {
                for record in records {
                    if tx.send(Ok(record)).await.is_err() {
                        break 'outer;
                    }
                }
            }
            Err(e) => {
                let terminal = matches!(e, Error::Closed | Error::Fatal { .. } | Error::Config(_));
                warn!(error = %e, terminal, "Poll failed in record stream");
                if tx.send(Err(e)).await.is_err() || terminal {
                    break;
                }
            }
        }
    }

    if let Err(e) = consumer.close().await {
        debug!(error = %e, "Closing stream consumer failed");
    }
}
