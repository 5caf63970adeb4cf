//! Scripted in-memory provider for exercising callers without a container
//! runtime.
//!
//! Every attach spawns a small task playing the unit: it reads stdin through an
//! in-memory pipe and answers on the combined output channel according to the
//! configured [`Behavior`]. The ledger records every call so tests can assert
//! that each created unit was stopped exactly once.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;

use crate::{
    Attachment, InputStream, IsolationProvider, OutputChunk, ResourceLimits, Result, SandboxError,
    UnitConfig, UnitHandle,
};

const PIPE_CAPACITY: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 16;

pub fn stdout(text: &str) -> OutputChunk {
    OutputChunk::Stdout(Bytes::copy_from_slice(text.as_bytes()))
}

pub fn stderr(text: &str) -> OutputChunk {
    OutputChunk::Stderr(Bytes::copy_from_slice(text.as_bytes()))
}

/// What the fake unit does once attached.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Read stdin to EOF, emit the chunks, exit.
    Script(Vec<OutputChunk>),
    /// Read stdin to EOF and write it back on stdout.
    Echo,
    /// Emit the chunks without reading stdin, then never exit.
    Hang(Vec<OutputChunk>),
    /// Emit `chunk` every `every` until the connection is closed.
    Flood { chunk: OutputChunk, every: Duration },
    /// Reject every write to stdin; output stays open until closed.
    BrokenInput,
    /// Read stdin to EOF, emit the chunks, then fail the output stream.
    BrokenOutput {
        chunks: Vec<OutputChunk>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Create,
    Start,
    Attach,
    Stop,
}

#[derive(Default)]
struct Ledger {
    created: Vec<(UnitHandle, String, ResourceLimits)>,
    started: Vec<UnitHandle>,
    attached: Vec<UnitHandle>,
    stopped: Vec<UnitHandle>,
    input: HashMap<UnitHandle, Vec<u8>>,
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FakeProvider {
    behavior: Behavior,
    failures: HashMap<Stage, fn() -> SandboxError>,
    delays: HashMap<Stage, Duration>,
    next_id: AtomicU64,
    ledger: Arc<Mutex<Ledger>>,
}

impl FakeProvider {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            failures: HashMap::new(),
            delays: HashMap::new(),
            next_id: AtomicU64::new(1),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// Make every call at `stage` fail with the error built by `error`.
    pub fn failing(mut self, stage: Stage, error: fn() -> SandboxError) -> Self {
        self.failures.insert(stage, error);
        self
    }

    /// Delay every call at `stage` by `delay` before it succeeds or fails.
    /// The ledger is written once the delay has passed.
    pub fn with_delay(mut self, stage: Stage, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn created(&self) -> Vec<UnitHandle> {
        lock(&self.ledger)
            .created
            .iter()
            .map(|(handle, _, _)| handle.clone())
            .collect()
    }

    pub fn started(&self) -> Vec<UnitHandle> {
        lock(&self.ledger).started.clone()
    }

    pub fn attached(&self) -> Vec<UnitHandle> {
        lock(&self.ledger).attached.clone()
    }

    pub fn stopped(&self) -> Vec<UnitHandle> {
        lock(&self.ledger).stopped.clone()
    }

    pub fn stop_count(&self, handle: &UnitHandle) -> usize {
        lock(&self.ledger)
            .stopped
            .iter()
            .filter(|h| *h == handle)
            .count()
    }

    /// Image and limits the unit was created with.
    pub fn created_with(&self, handle: &UnitHandle) -> Option<(String, ResourceLimits)> {
        lock(&self.ledger)
            .created
            .iter()
            .find(|(h, _, _)| h == handle)
            .map(|(_, image, limits)| (image.clone(), limits.clone()))
    }

    /// Bytes the unit read from stdin before EOF, if it read at all.
    pub fn received_input(&self, handle: &UnitHandle) -> Option<Vec<u8>> {
        lock(&self.ledger).input.get(handle).cloned()
    }

    async fn pause(&self, stage: Stage) {
        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
    }

    fn check(&self, stage: Stage) -> Result<()> {
        match self.failures.get(&stage) {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IsolationProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, config: &UnitConfig) -> Result<UnitHandle> {
        self.pause(Stage::Create).await;
        self.check(Stage::Create)?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = UnitHandle::new(format!("fake-{n}"));
        lock(&self.ledger).created.push((
            handle.clone(),
            config.image.clone(),
            config.limits.clone(),
        ));
        Ok(handle)
    }

    async fn start(&self, handle: &UnitHandle) -> Result<()> {
        self.pause(Stage::Start).await;
        self.check(Stage::Start)?;
        lock(&self.ledger).started.push(handle.clone());
        Ok(())
    }

    async fn attach(&self, handle: &UnitHandle) -> Result<Attachment> {
        self.pause(Stage::Attach).await;
        self.check(Stage::Attach)?;
        lock(&self.ledger).attached.push(handle.clone());

        let (client, unit_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        let input: InputStream = match self.behavior {
            Behavior::BrokenInput => Box::pin(BrokenPipe),
            _ => Box::pin(client),
        };
        tokio::spawn(play_unit(
            self.behavior.clone(),
            unit_stdin,
            tx,
            Arc::clone(&self.ledger),
            handle.clone(),
        ));

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(Attachment { input, output })
    }

    async fn stop(&self, handle: &UnitHandle, _grace: Duration) -> Result<()> {
        self.pause(Stage::Stop).await;
        lock(&self.ledger).stopped.push(handle.clone());
        self.check(Stage::Stop)
    }
}

type OutputSender = mpsc::Sender<Result<OutputChunk>>;

async fn play_unit(
    behavior: Behavior,
    mut stdin: DuplexStream,
    tx: OutputSender,
    ledger: Arc<Mutex<Ledger>>,
    handle: UnitHandle,
) {
    match behavior {
        Behavior::Script(chunks) => {
            read_stdin(&mut stdin, &ledger, &handle).await;
            emit(&tx, chunks).await;
        }
        Behavior::Echo => {
            let data = read_stdin(&mut stdin, &ledger, &handle).await;
            if !data.is_empty() {
                let _ = tx.send(Ok(OutputChunk::Stdout(Bytes::from(data)))).await;
            }
        }
        Behavior::Hang(chunks) => {
            emit(&tx, chunks).await;
            tx.closed().await;
        }
        Behavior::Flood { chunk, every } => loop {
            tokio::select! {
                () = tx.closed() => break,
                () = tokio::time::sleep(every) => {
                    if tx.send(Ok(chunk.clone())).await.is_err() {
                        break;
                    }
                }
            }
        },
        Behavior::BrokenInput => tx.closed().await,
        Behavior::BrokenOutput { chunks, message } => {
            read_stdin(&mut stdin, &ledger, &handle).await;
            emit(&tx, chunks).await;
            let _ = tx.send(Err(SandboxError::StreamFailed(message))).await;
        }
    }
}

async fn read_stdin(
    stdin: &mut DuplexStream,
    ledger: &Mutex<Ledger>,
    handle: &UnitHandle,
) -> Vec<u8> {
    let mut data = Vec::new();
    let _ = stdin.read_to_end(&mut data).await;
    lock(ledger).input.insert(handle.clone(), data.clone());
    data
}

async fn emit(tx: &OutputSender, chunks: Vec<OutputChunk>) {
    for chunk in chunks {
        if tx.send(Ok(chunk)).await.is_err() {
            return;
        }
    }
}

struct BrokenPipe;

impl AsyncWrite for BrokenPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "stdin closed by unit",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
