//! Simulated collaborators for tests.
//!
//! The pool core treats the wire codec and the event loop as external
//! dependencies; [`ScriptedFactory`] and [`SimLoop`] stand in for them so the
//! scheduling, pinning and auto-prepare machinery can be exercised
//! deterministically. Every sent command lands in a shared [`WireLog`];
//! responses are scripted per SQL substring; [`SimLoop::tick`] fires
//! readiness for every live subscription.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Error;
use crate::event_loop::{EventLoop, Interest, ReadinessHandler, Registration};
use crate::query::WireParam;
use crate::wire::{
    ConnectionOptions, PollingStatus, ResultStatus, SocketFd, TransactionStatus, WireConnection,
    WireFactory, WireResult,
};

/// One command observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentCommand {
    Raw {
        sql: String,
    },
    Parameterized {
        sql: String,
        params: Vec<WireParam>,
    },
    Prepare {
        statement: String,
        sql: String,
        num_params: usize,
    },
    Prepared {
        statement: String,
        params: Vec<WireParam>,
    },
    Reset,
    Cancel,
}

/// Shared record of everything sent across every scripted connection.
#[derive(Default)]
pub struct WireLog {
    entries: Mutex<Vec<SentCommand>>,
}

impl WireLog {
    fn push(&self, command: SentCommand) {
        self.entries.lock().push(command);
    }

    #[must_use]
    pub fn commands(&self) -> Vec<SentCommand> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Count commands matching a predicate.
    pub fn count(&self, predicate: impl Fn(&SentCommand) -> bool) -> usize {
        self.entries.lock().iter().filter(|c| predicate(c)).count()
    }
}

struct ScriptState {
    /// substring → (status, error message) applied to matching commands.
    rules: Mutex<Vec<(String, ResultStatus, String)>>,
    /// Commands containing one of these substrings stay busy until released.
    hold: Mutex<HashSet<String>>,
    connect_polls: AtomicUsize,
    fail_connect: AtomicBool,
    change_socket_during_connect: AtomicBool,
    next_fd: AtomicI32,
}

/// Produces [`ScriptedWire`] connections and carries the response script.
pub struct ScriptedFactory {
    log: Arc<WireLog>,
    state: Arc<ScriptState>,
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFactory {
    #[must_use]
    pub fn new() -> Self {
        ScriptedFactory {
            log: Arc::new(WireLog::default()),
            state: Arc::new(ScriptState {
                rules: Mutex::new(Vec::new()),
                hold: Mutex::new(HashSet::new()),
                connect_polls: AtomicUsize::new(0),
                fail_connect: AtomicBool::new(false),
                change_socket_during_connect: AtomicBool::new(false),
                next_fd: AtomicI32::new(10),
            }),
        }
    }

    #[must_use]
    pub fn log(&self) -> Arc<WireLog> {
        Arc::clone(&self.log)
    }

    /// Commands whose text contains `pattern` complete with `status` and
    /// `message` instead of the default `CommandOk`.
    pub fn respond_with(&self, pattern: &str, status: ResultStatus, message: &str) {
        self.state
            .rules
            .lock()
            .push((pattern.to_string(), status, message.to_string()));
    }

    /// Keep commands containing `pattern` executing until
    /// [`release`](Self::release).
    pub fn hold(&self, pattern: &str) {
        self.state.hold.lock().insert(pattern.to_string());
    }

    pub fn release(&self, pattern: &str) {
        self.state.hold.lock().remove(pattern);
    }

    /// Number of poll rounds an asynchronous connect spends before `Ok`.
    pub fn set_connect_polls(&self, polls: usize) {
        self.state.connect_polls.store(polls, Ordering::SeqCst);
    }

    /// Make asynchronous connects fail at the first poll.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Swap to a fresh socket during connect polling, the way libpq retries
    /// without SSL after a rejected SSL attempt.
    pub fn set_change_socket_during_connect(&self, change: bool) {
        self.state
            .change_socket_during_connect
            .store(change, Ordering::SeqCst);
    }

    fn wire(&self, connected: bool) -> ScriptedWire {
        let polls = self.state.connect_polls.load(Ordering::SeqCst);
        ScriptedWire {
            log: Arc::clone(&self.log),
            state: Arc::clone(&self.state),
            socket: self.state.next_fd.fetch_add(1, Ordering::SeqCst),
            polls_remaining: polls,
            current: None,
            txn: if connected {
                TransactionStatus::Idle
            } else {
                TransactionStatus::Unknown
            },
            error: String::new(),
        }
    }
}

impl WireFactory for ScriptedFactory {
    fn connect_start(&self, _options: &ConnectionOptions) -> Result<Box<dyn WireConnection>, Error> {
        Ok(Box::new(self.wire(false)))
    }

    fn connect_blocking(
        &self,
        _options: &ConnectionOptions,
    ) -> Result<Box<dyn WireConnection>, Error> {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("scripted connect failure".to_string()));
        }
        Ok(Box::new(self.wire(true)))
    }
}

/// A scripted result with a fixed status and message.
#[derive(Debug)]
pub struct ScriptedResult {
    pub status: ResultStatus,
    pub message: String,
}

impl WireResult for ScriptedResult {
    fn status(&self) -> ResultStatus {
        self.status
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CurrentCommand {
    text: String,
    status: ResultStatus,
    message: String,
}

/// Scripted stand-in for one libpq connection.
pub struct ScriptedWire {
    log: Arc<WireLog>,
    state: Arc<ScriptState>,
    socket: SocketFd,
    polls_remaining: usize,
    current: Option<CurrentCommand>,
    txn: TransactionStatus,
    error: String,
}

impl ScriptedWire {
    fn plan(&mut self, text: String) {
        let (status, message) = {
            let rules = self.state.rules.lock();
            rules
                .iter()
                .find(|(pattern, _, _)| text.contains(pattern.as_str()))
                .map_or((ResultStatus::CommandOk, String::new()), |(_, s, m)| {
                    (*s, m.clone())
                })
        };
        self.current = Some(CurrentCommand {
            text,
            status,
            message,
        });
    }

    fn held(&self, text: &str) -> bool {
        self.state
            .hold
            .lock()
            .iter()
            .any(|pattern| text.contains(pattern.as_str()))
    }

    fn apply_transaction_transition(&mut self, text: &str, status: ResultStatus) {
        let command = text.trim_start().to_ascii_lowercase();
        match status {
            ResultStatus::CommandOk | ResultStatus::TuplesOk => {
                if command.starts_with("begin") || command.starts_with("start transaction") {
                    self.txn = TransactionStatus::InTransaction;
                } else if command.starts_with("commit")
                    || command.starts_with("rollback")
                    || command.starts_with("end")
                {
                    self.txn = TransactionStatus::Idle;
                }
            }
            ResultStatus::FatalError | ResultStatus::BadResponse => {
                if self.txn.in_transaction() {
                    self.txn = TransactionStatus::InError;
                }
            }
            _ => {}
        }
    }

    fn finish_current(&mut self) -> Option<Box<dyn WireResult>> {
        let current = self.current.take()?;
        self.apply_transaction_transition(&current.text, current.status);
        if !current.message.is_empty() {
            self.error.clone_from(&current.message);
        }
        Some(Box::new(ScriptedResult {
            status: current.status,
            message: current.message,
        }))
    }
}

impl WireConnection for ScriptedWire {
    fn poll_connect(&mut self) -> PollingStatus {
        if self.state.fail_connect.load(Ordering::SeqCst) {
            self.error = "scripted connect failure".to_string();
            return PollingStatus::Failed;
        }
        if self.polls_remaining > 0 {
            self.polls_remaining -= 1;
            if self.state.change_socket_during_connect.load(Ordering::SeqCst) {
                self.socket = self.state.next_fd.fetch_add(1, Ordering::SeqCst);
            }
            return PollingStatus::Reading;
        }
        self.txn = TransactionStatus::Idle;
        PollingStatus::Ok
    }

    fn reset_start(&mut self) -> Result<(), Error> {
        self.log.push(SentCommand::Reset);
        self.error.clear();
        self.current = None;
        self.polls_remaining = self.state.connect_polls.load(Ordering::SeqCst);
        self.txn = TransactionStatus::Unknown;
        Ok(())
    }

    fn poll_reset(&mut self) -> PollingStatus {
        self.poll_connect()
    }

    fn send_raw(&mut self, sql: &str) -> Result<(), Error> {
        self.log.push(SentCommand::Raw {
            sql: sql.to_string(),
        });
        self.plan(sql.to_string());
        Ok(())
    }

    fn send_parameterized(
        &mut self,
        sql: &str,
        params: &[WireParam],
        _binary: bool,
    ) -> Result<(), Error> {
        self.log.push(SentCommand::Parameterized {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        self.plan(sql.to_string());
        Ok(())
    }

    fn send_prepare(
        &mut self,
        statement: &str,
        sql: &str,
        num_params: usize,
    ) -> Result<(), Error> {
        self.log.push(SentCommand::Prepare {
            statement: statement.to_string(),
            sql: sql.to_string(),
            num_params,
        });
        self.plan(format!("prepare:{sql}"));
        Ok(())
    }

    fn send_prepared(
        &mut self,
        statement: &str,
        params: &[WireParam],
        _binary: bool,
    ) -> Result<(), Error> {
        self.log.push(SentCommand::Prepared {
            statement: statement.to_string(),
            params: params.to_vec(),
        });
        self.plan(format!("execute:{statement}"));
        Ok(())
    }

    fn consume_input(&mut self) -> bool {
        match self.current.as_ref() {
            Some(current) => !self.held(&current.text),
            None => true,
        }
    }

    fn flush(&mut self) -> bool {
        true
    }

    fn get_result(&mut self) -> Option<Box<dyn WireResult>> {
        self.finish_current()
    }

    fn cancel(&mut self) {
        self.log.push(SentCommand::Cancel);
    }

    fn socket(&self) -> SocketFd {
        self.socket
    }

    fn error_message(&self) -> String {
        self.error.clone()
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.txn
    }

    fn exec_raw(&mut self, sql: &str) -> Result<Box<dyn WireResult>, Error> {
        self.send_raw(sql)?;
        self.finish_current()
            .ok_or_else(|| Error::Query("no scripted result".to_string()))
    }

    fn exec_parameterized(
        &mut self,
        sql: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<Box<dyn WireResult>, Error> {
        self.send_parameterized(sql, params, binary)?;
        self.finish_current()
            .ok_or_else(|| Error::Query("no scripted result".to_string()))
    }

    fn exec_prepare(
        &mut self,
        statement: &str,
        sql: &str,
        num_params: usize,
    ) -> Result<Box<dyn WireResult>, Error> {
        self.send_prepare(statement, sql, num_params)?;
        self.finish_current()
            .ok_or_else(|| Error::Query("no scripted result".to_string()))
    }

    fn exec_prepared(
        &mut self,
        statement: &str,
        params: &[WireParam],
        binary: bool,
    ) -> Result<Box<dyn WireResult>, Error> {
        self.send_prepared(statement, params, binary)?;
        self.finish_current()
            .ok_or_else(|| Error::Query("no scripted result".to_string()))
    }
}

struct RegistrationEntry {
    fd: SocketFd,
    interest: Interest,
    handler: Arc<dyn ReadinessHandler>,
}

#[derive(Default)]
struct SimLoopState {
    registrations: Mutex<HashMap<u64, RegistrationEntry>>,
    next_token: AtomicU64,
}

/// Single-threaded simulated event loop. Registrations accumulate;
/// [`tick`](Self::tick) fires readiness on every live subscription according
/// to its current interest. Scheduled closures run inline, which matches the
/// loop-thread semantics of the production loop because the whole simulation
/// runs on the test thread.
#[derive(Default)]
pub struct SimLoop {
    state: Arc<SimLoopState>,
}

impl SimLoop {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fire one readiness round. Handlers registered or removed during the
    /// round are picked up on the next one.
    pub fn tick(&self) {
        let snapshot: Vec<(Arc<dyn ReadinessHandler>, Interest)> = {
            let registrations = self.state.registrations.lock();
            registrations
                .values()
                .map(|entry| (Arc::clone(&entry.handler), entry.interest))
                .collect()
        };

        for (handler, interest) in snapshot {
            handler.ready(
                interest.contains(Interest::READ),
                interest.contains(Interest::WRITE),
            );
        }
    }

    /// Tick until no subscriptions remain, up to `max_ticks` rounds. Returns
    /// the number of rounds run.
    pub fn run_until_idle(&self, max_ticks: usize) -> usize {
        for round in 0..max_ticks {
            if self.registration_count() == 0 {
                return round;
            }
            self.tick();
        }
        max_ticks
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.state.registrations.lock().len()
    }

    #[must_use]
    pub fn registered_fds(&self) -> Vec<SocketFd> {
        self.state
            .registrations
            .lock()
            .values()
            .map(|entry| entry.fd)
            .collect()
    }
}

impl EventLoop for SimLoop {
    fn register(
        &self,
        fd: SocketFd,
        interest: Interest,
        handler: Arc<dyn ReadinessHandler>,
    ) -> Box<dyn Registration> {
        let token = self.state.next_token.fetch_add(1, Ordering::SeqCst);
        self.state.registrations.lock().insert(
            token,
            RegistrationEntry {
                fd,
                interest,
                handler,
            },
        );
        Box::new(SimRegistration {
            state: Arc::clone(&self.state),
            token,
        })
    }

    fn schedule(&self, f: Box<dyn FnOnce() + Send>) {
        f();
    }

    fn is_loop_thread(&self) -> bool {
        true
    }
}

struct SimRegistration {
    state: Arc<SimLoopState>,
    token: u64,
}

impl Registration for SimRegistration {
    fn rearm(&self, interest: Interest) {
        if let Some(entry) = self.state.registrations.lock().get_mut(&self.token) {
            entry.interest = interest;
        }
    }

    fn change_fd(&self, fd: SocketFd) {
        if let Some(entry) = self.state.registrations.lock().get_mut(&self.token) {
            entry.fd = fd;
        }
    }

    fn unregister(&self) {
        self.state.registrations.lock().remove(&self.token);
    }
}
