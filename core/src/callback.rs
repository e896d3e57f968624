use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, RwLock},
};

use tracing::warn;

use crate::{Address, ConnState, Error};

/// Callback invoked with operational errors that do not abort the
/// accept/receive loop.
pub type FuncError = Arc<dyn Fn(&Error) + Send + Sync>;

/// Callback invoked on every connection lifecycle transition.
pub type FuncInfo = Arc<dyn Fn(&Address, &Address, ConnState) + Send + Sync>;

/// Callback invoked with server lifecycle messages.
pub type FuncInfoServer = Arc<dyn Fn(&str) + Send + Sync>;

/// Replace-semantics registry for the three observability callbacks.
///
/// Each slot holds at most one function; registering replaces, `None`
/// clears. Dispatch clones the callback out of the slot so no lock is
/// held while user code runs, and contains panics so a misbehaving
/// callback can never take down an accept loop.
#[derive(Default)]
pub struct Callbacks {
    error: RwLock<Option<FuncError>>,
    info: RwLock<Option<FuncInfo>>,
    info_server: RwLock<Option<FuncInfoServer>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_error(&self, f: Option<FuncError>) {
        if let Ok(mut slot) = self.error.write() {
            *slot = f;
        }
    }

    pub fn register_info(&self, f: Option<FuncInfo>) {
        if let Ok(mut slot) = self.info.write() {
            *slot = f;
        }
    }

    pub fn register_info_server(&self, f: Option<FuncInfoServer>) {
        if let Ok(mut slot) = self.info_server.write() {
            *slot = f;
        }
    }

    /// Report an operational error. No-op when no callback is set.
    pub fn error(&self, e: &Error) {
        let f = match self.error.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(f) = f {
            contained(|| f(e));
        }
    }

    /// Report a connection state transition.
    pub fn info(&self, local: &Address, remote: &Address, state: ConnState) {
        if let Some(f) = self.info_slot() {
            contained(|| f(local, remote, state));
        }
    }

    /// Report a server lifecycle message.
    pub fn info_server(&self, msg: &str) {
        let f = match self.info_server.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(f) = f {
            contained(|| f(msg));
        }
    }

    /// Clone of the current info callback, for call sites that report
    /// several transitions in a row.
    pub fn info_slot(&self) -> Option<FuncInfo> {
        match self.info.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}

fn contained<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("panic in registered callback contained");
    }
}
