//! Exception-region opcodes: `leave`, `endfinally`/`endfault`, `throw`.
//!
//! The engine tracks which exception clauses cover each block. `leave`
//! runs the cleanup handlers of every region being exited before
//! jumping; with structured exception support compiled out, cleanup
//! handlers are invoked directly through their synthesized symbols.

use tracing::debug;

use ilforge_cil::resolver::WellKnownMethod;
use ilforge_target::symbol::cleanup_symbol;
use ilforge_target::Backend;

use crate::block::{ProtectedRegion, Terminator};
use crate::engine::Engine;
use crate::error::TranslateError;

impl<'a, B: Backend> Engine<'a, B> {
    /// Exception clauses whose try region covers `offset`, in clause
    /// table order (innermost first).
    pub(crate) fn active_regions(&self, offset: u32) -> Vec<ProtectedRegion> {
        self.body
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| c.try_contains(offset))
            .map(|(clause, _)| ProtectedRegion { clause })
            .collect()
    }

    /// Cleanup handlers still pending in the current block's regions,
    /// run before a `ret` when structured exception support is enabled.
    pub(crate) fn run_pending_cleanups(&mut self, _offset: u32) -> Result<(), TranslateError> {
        if !self.ctx.options.exceptions {
            return Ok(());
        }
        let body = self.body;
        let regions = self.current.regions.clone();
        for region in regions {
            if body.clauses[region.clause].kind.is_cleanup() {
                self.helper_call(WellKnownMethod::PopExecCleanup, "pop-exec-cleanup", &[])?;
            }
        }
        Ok(())
    }

    pub(crate) fn op_leave(&mut self, offset: u32, target: u32) -> Result<(), TranslateError> {
        let body = self.body;

        // Leaving a catch or filter handler restores the caller's frame
        // pointer before transferring control.
        let in_handler = body
            .clauses
            .iter()
            .any(|c| c.kind.takes_exception() && c.handler_contains(offset));
        if in_handler {
            self.ctx.backend.restore_frame();
        }

        // Run the cleanup handler of every protected region being
        // exited, innermost first.
        let regions = self.current.regions.clone();
        for region in regions {
            let clause = &body.clauses[region.clause];
            let exited = !clause.try_contains(target) && clause.kind.is_cleanup();
            if !exited {
                continue;
            }
            if self.ctx.options.exceptions {
                self.helper_call(WellKnownMethod::PopExecCleanup, "pop-exec-cleanup", &[])?;
            } else {
                let sym = cleanup_symbol(
                    self.ctx.options.apartment,
                    self.ctx.method,
                    clause.handler_offset,
                );
                debug!(symbol = %sym, "direct cleanup call");
                self.ctx.backend.call_symbol(&sym);
            }
        }

        // `leave` empties the evaluation stack.
        self.discard_stack()?;

        self.ctx.backend.jump(target);
        self.current.terminator = Some(Terminator::Jump { target });
        self.enqueue(target, Vec::new());
        Ok(())
    }

    /// `endfinally`/`endfault`: return from the synthesized cleanup
    /// handler.
    pub(crate) fn op_endfinally(&mut self, _offset: u32) -> Result<(), TranslateError> {
        self.discard_stack()?;
        self.ctx.backend.emit_return();
        self.current.terminator = Some(Terminator::Return);
        Ok(())
    }

    pub(crate) fn op_throw(&mut self, offset: u32) -> Result<(), TranslateError> {
        let mut exception = self.pop(offset)?;
        if self.ctx.options.exceptions {
            self.evaluate(&mut exception, 0, false)?;
            let reg = self.entity_reg(&exception)?;
            self.helper_call(WellKnownMethod::Raise, "raise", &[reg])?;
            self.release_entity(exception)?;
            self.discard_stack()?;
            self.current.terminator = Some(Terminator::Throw);
        } else {
            // Without exception support the raise degrades to dropping
            // the object and ending the block unreachable.
            self.release_entity(exception)?;
            self.discard_stack()?;
            self.current.terminator = Some(Terminator::Unreachable);
        }
        Ok(())
    }

    fn discard_stack(&mut self) -> Result<(), TranslateError> {
        let stack = std::mem::take(&mut self.current.stack);
        for entity in stack {
            self.release_entity(entity)?;
        }
        Ok(())
    }
}
