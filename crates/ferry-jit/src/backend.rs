//! Executable code arena
//!
//! Wraps a Cranelift `JITModule` for the host ISA. One arena backs one
//! session: every thunk of the session is defined into it, and all of them
//! are released together.
//!
//! A closed session's arena is not unmapped on the spot. It is retired to the
//! [`Graveyard`] with the contexts its code points at, and freed by a later
//! reclaim pass once the session's active-thunk count has stayed at zero.

use crate::{resource_error, OptLevel};
use cranelift_codegen::ir::{Function, Signature, Type};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use ferry_runtime::{UpcallContext, UpcallResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// JIT memory owned by a session
pub struct CodeArena {
    module: JITModule,
    opt_level: OptLevel,
    functions: usize,
}

// Safety: the module's raw code pointers are only dereferenced by native
// callers; the arena itself is only touched under the owning session's lock.
unsafe impl Send for CodeArena {}

impl CodeArena {
    /// Create an arena targeting the host ISA
    pub fn new(opt_level: OptLevel) -> UpcallResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level.as_str())
            .map_err(|e| resource_error("failed to set opt_level", e))?;
        flag_builder
            .set("use_colocated_libcalls", "false")
            .map_err(|e| resource_error("failed to set use_colocated_libcalls", e))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| resource_error("failed to set is_pic", e))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| resource_error("failed to create ISA builder", e))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| resource_error("failed to create ISA", e))?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        Ok(Self {
            module: JITModule::new(builder),
            opt_level,
            functions: 0,
        })
    }

    pub fn isa(&self) -> &dyn TargetIsa {
        self.module.isa()
    }

    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    /// Calling convention of `extern "C"` functions on the host
    pub fn host_call_conv(&self) -> CallConv {
        self.module.isa().default_call_conv()
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    /// Number of functions compiled into this arena
    pub fn function_count(&self) -> usize {
        self.functions
    }

    /// Compile `func` and make it executable
    ///
    /// The returned pointer is valid until [`CodeArena::free`].
    pub fn compile(&mut self, signature: &Signature, func: Function) -> UpcallResult<*const u8> {
        let id = self
            .module
            .declare_anonymous_function(signature)
            .map_err(|e| resource_error("failed to declare thunk", e))?;

        let mut ctx = self.module.make_context();
        ctx.func = func;
        let defined = self.module.define_function(id, &mut ctx);
        self.module.clear_context(&mut ctx);
        defined.map_err(|e| resource_error("failed to compile thunk", e))?;

        self.module
            .finalize_definitions()
            .map_err(|e| resource_error("failed to finalize thunk", e))?;
        self.functions += 1;
        Ok(self.module.get_finalized_function(id))
    }

    /// Release all code memory
    ///
    /// # Safety
    ///
    /// No pointer returned by [`CodeArena::compile`] may be executing or
    /// executed again.
    pub unsafe fn free(self) {
        self.module.free_memory();
    }
}

/// Code and contexts of a closed session awaiting reclamation
pub(crate) struct RetiredArena {
    session: u64,
    arena: CodeArena,
    active: Arc<AtomicUsize>,
    contexts: Vec<Box<UpcallContext>>,
}

impl RetiredArena {
    pub(crate) fn new(
        session: u64,
        arena: CodeArena,
        active: Arc<AtomicUsize>,
        contexts: Vec<Box<UpcallContext>>,
    ) -> Self {
        Self {
            session,
            arena,
            active,
            contexts,
        }
    }

    fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }
}

/// Retired arenas, freed once no thread can still be executing them
pub(crate) struct Graveyard {
    retired: Vec<RetiredArena>,
}

impl Graveyard {
    pub(crate) const fn new() -> Self {
        Self {
            retired: Vec::new(),
        }
    }

    pub(crate) fn retire(&mut self, retired: RetiredArena) {
        self.retired.push(retired);
    }

    pub(crate) fn len(&self) -> usize {
        self.retired.len()
    }

    /// Free every retired arena with no thread inside its code
    ///
    /// Returns the number of arenas freed.
    ///
    /// # Safety
    ///
    /// Threads that have left a thunk's counted region still execute its
    /// epilogue. Callers must only reclaim once those returns are complete,
    /// which holds for arenas retired before the current close began.
    pub(crate) unsafe fn reclaim(&mut self) -> usize {
        let (idle, busy): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.retired).into_iter().partition(RetiredArena::is_idle);
        self.retired = busy;

        let freed = idle.len();
        for RetiredArena {
            session,
            arena,
            contexts,
            ..
        } in idle
        {
            let thunks = arena.function_count();
            arena.free();
            drop(contexts);
            tracing::debug!(session, thunks, "reclaimed thunk code");
        }
        freed
    }
}
