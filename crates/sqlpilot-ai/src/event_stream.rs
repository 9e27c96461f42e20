use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::types::{AssistantMessage, AssistantMessageEvent};

type CompletionFn<T, R> = dyn Fn(&T) -> Option<R> + Send + Sync;

struct Shared<T, R> {
    sender: mpsc::UnboundedSender<T>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<T>>,
    completion: Arc<CompletionFn<T, R>>,
    final_result: Mutex<Option<R>>,
    notify: Notify,
    closed: AtomicBool,
}

/// Multi-consumer event channel that also resolves to a single final result.
///
/// The completion function inspects every pushed event; the first event it maps
/// to `Some(result)` fixes the result and closes the stream for further pushes.
pub struct EventStream<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for EventStream<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, R> EventStream<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F>(completion: F) -> Self
    where
        F: Fn(&T) -> Option<R> + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver: AsyncMutex::new(receiver),
                completion: Arc::new(completion),
                final_result: Mutex::new(None),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn push(&self, event: T) {
        if self.is_closed() {
            return;
        }

        if let Some(result) = (self.shared.completion)(&event) {
            self.store_result(result);
            self.shared.closed.store(true, Ordering::SeqCst);
        }

        let _ = self.shared.sender.send(event);
        self.shared.notify.notify_waiters();
    }

    pub fn end(&self, result: Option<R>) {
        if self.is_closed() {
            return;
        }
        if let Some(result) = result {
            self.store_result(result);
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut receiver = self.shared.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(event) => return Some(event),
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) if self.is_closed() => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }
            notified.await;
        }
    }

    pub async fn result(&self) -> Option<R> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(result) = self.current_result() {
                return Some(result);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    fn current_result(&self) -> Option<R> {
        self.shared
            .final_result
            .lock()
            .expect("event stream result mutex poisoned")
            .clone()
    }

    fn store_result(&self, result: R) {
        let mut guard = self
            .shared
            .final_result
            .lock()
            .expect("event stream result mutex poisoned");
        if guard.is_none() {
            *guard = Some(result);
        }
    }
}

/// Event stream of a single assistant response; resolves on `Done` or `Error`.
#[derive(Clone)]
pub struct AssistantMessageEventStream {
    inner: EventStream<AssistantMessageEvent, AssistantMessage>,
}

impl AssistantMessageEventStream {
    pub fn new() -> Self {
        let inner = EventStream::new(|event| match event {
            AssistantMessageEvent::Done { message, .. } => Some(message.clone()),
            AssistantMessageEvent::Error { error, .. } => Some(error.clone()),
            _ => None,
        });
        Self { inner }
    }

    /// Stream that already holds a finished response.
    pub fn completed(message: AssistantMessage) -> Self {
        let stream = Self::new();
        stream.push(AssistantMessageEvent::Start {
            partial: message.clone(),
        });
        stream.push(AssistantMessageEvent::Done {
            reason: crate::types::DoneReason::ToolUse,
            message,
        });
        stream
    }

    pub fn push(&self, event: AssistantMessageEvent) {
        self.inner.push(event);
    }

    pub fn end(&self, result: Option<AssistantMessage>) {
        self.inner.end(result);
    }

    pub async fn next(&self) -> Option<AssistantMessageEvent> {
        self.inner.next().await
    }

    pub async fn result(&self) -> Option<AssistantMessage> {
        self.inner.result().await
    }
}

impl Default for AssistantMessageEventStream {
    fn default() -> Self {
        Self::new()
    }
}
