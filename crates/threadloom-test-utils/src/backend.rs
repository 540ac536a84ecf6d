use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::ChatBackend;
use threadloom_core::types::ChatRequest;

#[derive(Debug, Clone)]
enum Tail {
    End,
    Error(String),
    Hang,
}

#[derive(Debug, Clone)]
struct Script {
    chunks: Vec<String>,
    tail: Tail,
}

/// Scripted chat backend. Each call pops the next queued script, falling
/// back to the default reply once the queue is empty.
pub struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockBackend {
    /// Every call streams `chunks` and ends.
    pub fn new(chunks: &[&str]) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Script {
                chunks: chunks.iter().map(|c| c.to_string()).collect(),
                tail: Tail::End,
            },
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every call streams `chunks` and then never finishes.
    pub fn hanging(chunks: &[&str]) -> Self {
        let mut backend = Self::new(chunks);
        backend.fallback.tail = Tail::Hang;
        backend
    }

    /// Queue a reply that ends normally.
    pub fn then_reply(self, chunks: &[&str]) -> Self {
        self.push(chunks, Tail::End)
    }

    /// Queue a reply that fails after its chunks.
    pub fn then_error(self, chunks: &[&str], message: &str) -> Self {
        self.push(chunks, Tail::Error(message.to_string()))
    }

    fn push(self, chunks: &[&str], tail: Tail) -> Self {
        self.scripts.lock().unwrap().push_back(Script {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            tail,
        });
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatBackend for MockBackend {
    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            let head = stream::iter(script.chunks.into_iter().map(Ok));
            let stream: BoxStream<'_, Result<String>> = match script.tail {
                Tail::End => head.boxed(),
                Tail::Error(msg) => head
                    .chain(stream::once(async move {
                        Err(ThreadloomError::ProviderError(msg))
                    }))
                    .boxed(),
                Tail::Hang => head.chain(stream::pending()).boxed(),
            };
            Ok(stream)
        })
    }
}
