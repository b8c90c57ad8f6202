//! # Compiled Functions
//!
//! Immutable pairing of a function's source tree with its linked bytecode.
//! The only mutable part is the breakpoint table, which sits behind a spin
//! lock so breakpoints can be toggled through the shared function table.

use alloc::boxed::Box;
use alloc::collections::btree_map::Entry;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::ast::Function;
use crate::bytecode::LinkedCode;
use crate::machine::InstructionCounter;
use crate::FunctionSignature;

/// Index of a function in a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionIndex(pub u32);

impl FunctionIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Where and when a breakpoint fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub function: FunctionIndex,
    /// Bytecode address of the next instruction to execute.
    pub address: usize,
    pub counter: InstructionCounter,
}

/// Callback run when a breakpoint is reached.
pub type BreakpointHandler = Box<dyn FnMut(&BreakpointHit) + Send>;

/// A function ready to execute.
pub struct CompiledFunction {
    index: FunctionIndex,
    module: String,
    source: Function,
    signature_id: u32,
    code: LinkedCode,
    /// Bytecode address of each tree node, in pre-order.
    anchors: Vec<u32>,
    breakpoints: Mutex<BTreeMap<usize, BreakpointHandler>>,
}

impl CompiledFunction {
    pub(crate) fn new(
        index: FunctionIndex,
        module: String,
        source: Function,
        signature_id: u32,
        code: LinkedCode,
        anchors: Vec<u32>,
    ) -> Self {
        Self {
            index,
            module,
            source,
            signature_id,
            code,
            anchors,
            breakpoints: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn index(&self) -> FunctionIndex {
        self.index
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    /// The instruction tree this code was compiled from.
    pub fn source(&self) -> &Function {
        &self.source
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.source.signature
    }

    /// Program-wide interned signature id, compared by `call_indirect`.
    pub fn signature_id(&self) -> u32 {
        self.signature_id
    }

    pub fn code(&self) -> &LinkedCode {
        &self.code
    }

    /// Number of local cells a frame needs.
    pub fn local_count(&self) -> usize {
        self.source.local_count()
    }

    /// Bytecode address of the `node`-th instruction (pre-order).
    pub fn address_of(&self, node: usize) -> Option<usize> {
        self.anchors.get(node).map(|&a| a as usize)
    }

    /// Registers `handler` at `address`, replacing any previous one.
    pub fn add_breakpoint(&self, address: usize, handler: BreakpointHandler) {
        self.breakpoints.lock().insert(address, handler);
    }

    /// Returns whether a breakpoint was registered at `address`.
    pub fn remove_breakpoint(&self, address: usize) -> bool {
        self.breakpoints.lock().remove(&address).is_some()
    }

    pub fn has_breakpoint(&self, address: usize) -> bool {
        self.breakpoints.lock().contains_key(&address)
    }

    /// Runs the handler registered at `hit.address`, if any.
    ///
    /// The handler runs with the table unlocked, so it may add or remove
    /// breakpoints. It is put back only if its slot is still empty.
    pub fn trigger_breakpoint(&self, hit: &BreakpointHit) -> bool {
        let Some(mut handler) = self.breakpoints.lock().remove(&hit.address) else {
            return false;
        };
        handler(hit);
        if let Entry::Vacant(slot) = self.breakpoints.lock().entry(hit.address) {
            slot.insert(handler);
        }
        true
    }
}

impl core::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("index", &self.index)
            .field("module", &self.module)
            .field("name", &self.source.name)
            .field("code_size", &self.code.size())
            .field("breakpoints", &self.breakpoints.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ByteCode, Opcode};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn function() -> CompiledFunction {
        let mut code = ByteCode::new();
        code.append_opcode(Opcode::Nop);
        code.append_opcode(Opcode::End);
        code.append(0u8);
        CompiledFunction::new(
            FunctionIndex(0),
            String::from("m"),
            Function::new("f", FunctionSignature::new(&[], None), Vec::new(), Vec::new()),
            0,
            LinkedCode::new(code),
            alloc::vec![0, 2],
        )
    }

    #[test]
    fn test_breakpoints() {
        let f = function();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        f.add_breakpoint(
            2,
            Box::new(move |hit| {
                assert_eq!(hit.address, 2);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(f.has_breakpoint(2));

        let hit = BreakpointHit {
            function: FunctionIndex(0),
            address: 2,
            counter: InstructionCounter(1),
        };
        assert!(f.trigger_breakpoint(&hit));
        assert!(!f.trigger_breakpoint(&BreakpointHit { address: 0, ..hit }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(f.remove_breakpoint(2));
        assert!(!f.remove_breakpoint(2));
        assert!(!f.trigger_breakpoint(&hit));
    }

    #[test]
    fn test_handler_may_edit_breakpoints() {
        let f = Arc::new(function());
        let hit = BreakpointHit {
            function: FunctionIndex(0),
            address: 2,
            counter: InstructionCounter(1),
        };

        // one-shot: removes itself
        let this = f.clone();
        f.add_breakpoint(
            2,
            Box::new(move |hit| {
                assert!(this.remove_breakpoint(hit.address));
            }),
        );
        assert!(f.trigger_breakpoint(&hit));
        assert!(!f.has_breakpoint(2));
        assert!(!f.trigger_breakpoint(&hit));

        // a replacement installed by the handler wins over the handler
        let hits = Arc::new(AtomicUsize::new(0));
        let this = f.clone();
        let counter = hits.clone();
        f.add_breakpoint(
            2,
            Box::new(move |_| {
                let counter = counter.clone();
                this.add_breakpoint(
                    2,
                    Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
                this.add_breakpoint(0, Box::new(|_| {}));
            }),
        );
        assert!(f.trigger_breakpoint(&hit));
        assert!(f.has_breakpoint(0));
        assert!(f.trigger_breakpoint(&hit));
        assert!(f.trigger_breakpoint(&hit));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_anchors() {
        let f = function();
        assert_eq!(f.address_of(1), Some(2));
        assert_eq!(f.address_of(2), None);
        assert_eq!(f.local_count(), 0);
    }
}
