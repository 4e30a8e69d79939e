//! Sessions - lifetime scopes for generated thunks
//!
//! A session owns a code arena, the contexts its thunks point at, and the
//! invocation gate those thunks pass through. Closing a session refuses new
//! invocations, waits for running ones to leave the handler and then the
//! thunk code itself, and retires the code for reclamation.

use crate::backend::{CodeArena, Graveyard, RetiredArena};
use crate::codegen::{self, ThunkBindings};
use crate::OptLevel;
use ferry_runtime::handler::{self, FailurePolicy, UpcallContext};
use ferry_runtime::{CallingSequence, InvocationGate, UpcallError, UpcallResult, UpcallTarget};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THUNK_ID: AtomicU64 = AtomicU64::new(1);
static GRAVEYARD: Mutex<Graveyard> = parking_lot::const_mutex(Graveyard::new());

/// Free the code of closed sessions that no thread is executing
///
/// Every `close` already reclaims sessions closed before it; this also
/// reclaims the most recently closed ones. Returns the number of arenas freed.
///
/// # Safety
///
/// No native caller may still be returning from a thunk of a closed session.
pub unsafe fn reclaim_retired() -> usize {
    GRAVEYARD.lock().reclaim()
}

/// A native-callable code address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeAddress(usize);

impl NativeAddress {
    pub const NULL: NativeAddress = NativeAddress(0);

    pub fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterpret the address as a function pointer type
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type whose signature and ABI match the
    /// descriptor the thunk was linked with, and the owning session must stay
    /// open for as long as the pointer is called.
    pub unsafe fn to_fn<F: Copy>(self) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        std::mem::transmute_copy(&self.0)
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to one generated thunk
///
/// The address reads as null once the owning session has closed.
#[derive(Debug, Clone)]
pub struct ThunkHandle {
    id: u64,
    session_id: u64,
    address: Arc<AtomicUsize>,
}

impl ThunkHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn address(&self) -> NativeAddress {
        NativeAddress(self.address.load(Ordering::Acquire))
    }

    pub fn is_valid(&self) -> bool {
        !self.address().is_null()
    }
}

struct ThunkRecord {
    id: u64,
    address: Arc<AtomicUsize>,
    // Boxed so the address baked into the thunk never moves
    context: Box<UpcallContext>,
}

struct SessionState {
    arena: Option<CodeArena>,
    thunks: Vec<ThunkRecord>,
    closed: bool,
    opt_level: OptLevel,
}

/// Lifetime scope owning generated thunks
///
/// # Example
///
/// ```no_run
/// use ferry_jit::Session;
///
/// let result = Session::scoped(|session| {
///     assert!(session.is_open());
///     session.thunk_count()
/// });
/// assert_eq!(result, 0);
/// ```
pub struct Session {
    id: u64,
    gate: Arc<InvocationGate>,
    // Threads anywhere inside this session's thunk code
    active: Arc<AtomicUsize>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Open a session generating code at the default optimisation level
    pub fn open() -> Self {
        Self::with_opt_level(OptLevel::default())
    }

    pub fn with_opt_level(opt_level: OptLevel) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session = id, opt_level = opt_level.as_str(), "session opened");
        Self {
            id,
            gate: Arc::new(InvocationGate::new()),
            active: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(SessionState {
                arena: None,
                thunks: Vec::new(),
                closed: false,
                opt_level,
            }),
        }
    }

    /// Run `f` with a fresh session that is closed on every exit path
    pub fn scoped<R>(f: impl FnOnce(&Session) -> R) -> R {
        let session = Session::open();
        let result = f(&session);
        session.close();
        result
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of live thunks owned by this session
    pub fn thunk_count(&self) -> usize {
        self.state.lock().thunks.len()
    }

    pub fn is_open(&self) -> bool {
        !self.state.lock().closed && !self.gate.is_closing()
    }

    /// Number of invocations currently running inside this session's thunks
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Generate a thunk for `sequence` bound to `target`
    pub(crate) fn emit(
        &self,
        target: UpcallTarget,
        sequence: Arc<CallingSequence>,
        policy: FailurePolicy,
    ) -> UpcallResult<ThunkHandle> {
        let mut state = self.state.lock();
        if state.closed || self.gate.is_closing() {
            return Err(UpcallError::Lifecycle { session: self.id });
        }

        let thunk_id = NEXT_THUNK_ID.fetch_add(1, Ordering::Relaxed);
        let context = Box::new(UpcallContext::new(
            target,
            Arc::clone(&sequence),
            Arc::clone(&self.gate),
            policy,
            thunk_id,
            self.id,
        ));
        let context_addr = &*context as *const UpcallContext as usize;

        let mut arena = match state.arena.take() {
            Some(arena) => arena,
            None => CodeArena::new(state.opt_level)?,
        };
        let bindings = ThunkBindings {
            context: context_addr,
            handler: handler::entry_address(),
            active: Arc::as_ptr(&self.active) as usize,
        };
        let compiled = compile(&mut arena, &sequence, bindings);
        state.arena = Some(arena);
        let code = compiled?;

        // close() may have started while we compiled; it will free the arena
        if self.gate.is_closing() {
            return Err(UpcallError::Lifecycle { session: self.id });
        }

        let address = Arc::new(AtomicUsize::new(0));
        address.store(code as usize, Ordering::Release);
        state.thunks.push(ThunkRecord {
            id: thunk_id,
            address: Arc::clone(&address),
            context,
        });

        tracing::debug!(
            session = self.id,
            thunk = thunk_id,
            abi = sequence.abi(),
            address = %NativeAddress(code as usize),
            "emitted upcall thunk"
        );
        Ok(ThunkHandle {
            id: thunk_id,
            session_id: self.id,
            address,
        })
    }

    /// Close the session
    ///
    /// Blocks until every in-flight invocation of this session's thunks has
    /// returned, invalidates their addresses and retires their code. Later
    /// calls return immediately. Must not be called from inside an upcall
    /// running in this session.
    pub fn close(&self) {
        self.gate.close();

        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        for thunk in &state.thunks {
            thunk.address.store(0, Ordering::Release);
        }
        // Callers past the gate only have the thunk's return path left
        while self.active.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }

        let thunks = std::mem::take(&mut state.thunks);
        let released = thunks.len();
        let mut contexts = Vec::with_capacity(released);
        for thunk in thunks {
            tracing::trace!(
                session = self.id,
                thunk = thunk.id,
                target = ?thunk.context.target(),
                "released thunk"
            );
            contexts.push(thunk.context);
        }

        let mut graveyard = GRAVEYARD.lock();
        // Safety: arenas already in the graveyard were retired by earlier closes
        let reclaimed = unsafe { graveyard.reclaim() };
        if let Some(arena) = state.arena.take() {
            graveyard.retire(RetiredArena::new(self.id, arena, Arc::clone(&self.active), contexts));
        }
        tracing::info!(session = self.id, thunks = released, reclaimed, "session closed");
    }
}

fn compile(arena: &mut CodeArena, sequence: &CallingSequence, bindings: ThunkBindings) -> UpcallResult<*const u8> {
    let pointer = arena.pointer_type();
    let thunk = codegen::thunk_signature(sequence, pointer)?;
    let func = codegen::translate(sequence, &thunk, pointer, arena.host_call_conv(), bindings)?;
    arena.compile(&thunk.signature, func)
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("thunks", &state.thunks.len())
            .field("closed", &state.closed)
            .field("opt_level", &state.opt_level)
            .finish()
    }
}
