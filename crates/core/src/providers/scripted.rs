//! Scripted provider for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ConnectionCheck, EmailMessage, ProviderAdapter, ProviderKind, SendReceipt};
use crate::error::ProviderError;

/// What a scripted send does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Accept the message.
    Accept,
    /// Fail with this HTTP status.
    Status(u16),
    /// Fail before reaching the provider.
    Transport,
}

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<ScriptedOutcome>>,
    always: HashMap<String, ScriptedOutcome>,
    accepted: Vec<EmailMessage>,
    attempts_by_address: HashMap<String, usize>,
}

/// In-memory provider whose answers are scripted per recipient address.
///
/// Unscripted addresses are accepted and get a sequential message id.
pub struct ScriptedProvider {
    kind: ProviderKind,
    latency: Option<Duration>,
    script: Mutex<Script>,
    verify_error: Mutex<Option<String>>,
    send_count: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// A provider that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: ProviderKind::SendGrid,
            latency: None,
            script: Mutex::new(Script::default()),
            verify_error: Mutex::new(None),
            send_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Report a different provider kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sleep this long inside every send.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a one-shot outcome for the next send to `address`.
    pub fn push_outcome(&self, address: &str, outcome: ScriptedOutcome) {
        self.lock()
            .queued
            .entry(address.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Fail the next send to `address` with `status`.
    pub fn fail_next(&self, address: &str, status: u16) {
        self.push_outcome(address, ScriptedOutcome::Status(status));
    }

    /// Fail every send to `address` with `status`.
    pub fn fail_always(&self, address: &str, status: u16) {
        self.lock()
            .always
            .insert(address.to_string(), ScriptedOutcome::Status(status));
    }

    /// Make `verify_connection` report `error`.
    pub fn fail_verification(&self, error: &str) {
        *self
            .verify_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    /// Total send calls, including failed ones.
    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Send calls addressed to `address`, including failed ones.
    pub fn sends_to(&self, address: &str) -> usize {
        self.lock()
            .attempts_by_address
            .get(address)
            .copied()
            .unwrap_or_default()
    }

    /// Messages the provider accepted, in order.
    pub fn accepted(&self) -> Vec<EmailMessage> {
        self.lock().accepted.clone()
    }

    /// Distinct addresses that were accepted at least once.
    pub fn accepted_addresses(&self) -> HashSet<String> {
        self.lock().accepted.iter().map(|m| m.to.clone()).collect()
    }

    /// Most sends observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_outcome(&self, address: &str) -> ScriptedOutcome {
        let mut script = self.lock();
        *script
            .attempts_by_address
            .entry(address.to_string())
            .or_default() += 1;
        if let Some(outcome) = script.queued.get_mut(address).and_then(VecDeque::pop_front) {
            return outcome;
        }
        script
            .always
            .get(address)
            .cloned()
            .unwrap_or(ScriptedOutcome::Accept)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn send(&self, message: &EmailMessage) -> Result<SendReceipt, ProviderError> {
        let n = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let outcome = self.next_outcome(&message.to);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            ScriptedOutcome::Accept => {
                self.lock().accepted.push(message.clone());
                Ok(SendReceipt {
                    provider_message_id: Some(format!("scripted-{n}")),
                })
            }
            ScriptedOutcome::Status(status) => Err(ProviderError::Http {
                status,
                body: format!("scripted failure for {}", message.to),
            }),
            ScriptedOutcome::Transport => {
                Err(ProviderError::Transport("scripted connection reset".to_string()))
            }
        }
    }

    async fn verify_connection(&self) -> ConnectionCheck {
        let error = self
            .verify_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        error.map_or_else(ConnectionCheck::ok, ConnectionCheck::failed)
    }
}
