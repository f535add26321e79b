//! Scripted transports for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::config::SshConfig;
use super::error::SshError;
use super::transport::{Connector, RemoteTransport};

type Responder = Box<dyn FnMut(&str) -> Result<String, SshError> + Send>;

/// Transport whose command results come from a closure
pub struct MockTransport {
    alive: AtomicBool,
    closed: AtomicBool,
    commands: Mutex<Vec<String>>,
    responder: Mutex<Responder>,
}

impl MockTransport {
    /// Every command succeeds with empty output
    pub fn new() -> Self {
        Self::with_responder(|_| Ok(String::new()))
    }

    pub fn with_responder<F>(f: F) -> Self
    where
        F: FnMut(&str) -> Result<String, SshError> + Send + 'static,
    {
        Self {
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(f)),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every command run so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    fn respond(&self, cmd: &str) -> Result<String, SshError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        self.commands.lock().push(cmd.to_string());
        let mut responder = self.responder.lock();
        (*responder)(cmd)
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn run_command(&self, cmd: &str) -> Result<String, SshError> {
        self.respond(cmd)
    }

    async fn run_command_with_pty(
        &self,
        cmd: &str,
        _cols: u32,
        _rows: u32,
    ) -> Result<String, SshError> {
        self.respond(cmd)
    }

    async fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Connector handing out fresh `MockTransport`s, or failing on demand
#[derive(Default)]
pub struct MockConnector {
    fail: AtomicBool,
    dials: AtomicUsize,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }

    /// Park later dials until a permit is added to the returned semaphore
    pub fn hold_dials(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SshConfig) -> Result<Arc<dyn RemoteTransport>, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SshError::Network(format!("{} unreachable", config.address())));
        }
        let transport = Arc::new(MockTransport::new());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}
