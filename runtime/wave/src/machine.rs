//! # Machine
//!
//! Owns a linked program's functions and tables, the heap, the thread and
//! the instruction counter, and exposes stepping, breakpoints and
//! reversible execution.
//!
//! The counter advances once per executed instruction, including the one
//! that traps. History rewinds it together with the rest of the state, so
//! `counter()` always names the point the machine is at.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::compiler::Program;
use crate::config::MachineConfig;
use crate::error::{HistoryError, Trap, VmError};
use crate::function::{BreakpointHandler, BreakpointHit, CompiledFunction, FunctionIndex};
use crate::heap::{Heap, MAX_HEAP_SIZE, PAGE_SIZE};
use crate::history::{History, HistoryState};
use crate::observer::{Observer, Unobserved};
use crate::thread::{StepOutcome, Thread};
use crate::WasmValue;

/// Number of instructions executed since the thread was started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstructionCounter(pub u64);

impl InstructionCounter {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Result of a single machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// One instruction executed; more remain.
    Stepped,
    /// The instruction about to run next carries a breakpoint.
    Breakpoint(BreakpointHit),
    /// The entry function returned.
    Finished,
    /// The instruction trapped.
    Trapped(Trap),
}

/// The state history rewinds: everything but the history itself.
#[derive(Debug)]
pub(crate) struct Engine {
    pub(crate) functions: Vec<Arc<CompiledFunction>>,
    pub(crate) tables: Vec<Vec<Option<FunctionIndex>>>,
    pub(crate) heap: Heap,
    pub(crate) thread: Thread,
    pub(crate) counter: InstructionCounter,
}

impl Engine {
    pub(crate) fn step(&mut self, observer: &mut dyn Observer) -> Result<StepOutcome, VmError> {
        let outcome = self.thread.step(&self.functions, &self.tables, &mut self.heap, observer)?;
        self.counter = self.counter.next();
        Ok(outcome)
    }
}

/// A linked program ready to run.
#[derive(Debug)]
pub struct Machine {
    engine: Engine,
    history: History,
    symbols: BTreeMap<String, BTreeMap<String, FunctionIndex>>,
    config: MachineConfig,
}

impl Machine {
    /// Instantiates `program`: allocates its linear memory and copies the
    /// data segments in.
    pub fn new(program: Program, config: MachineConfig) -> Result<Self, VmError> {
        let (functions, tables, memory, symbols) = program.into_parts();

        let mut max_size = config.max_heap_size.min(MAX_HEAP_SIZE);
        if let Some(pages) = memory.max_pages {
            max_size = max_size.min((pages as usize).saturating_mul(PAGE_SIZE));
        }
        let mut heap = Heap::with_pages(memory.initial_pages, max_size)?;
        for segment in &memory.data {
            heap.set_bytes(segment.offset as usize, &segment.bytes, &mut Unobserved)?;
        }

        debug!(
            "machine created: {} functions, {} pages of {} max bytes",
            functions.len(),
            heap.pages(),
            heap.max_size()
        );
        Ok(Self {
            engine: Engine {
                functions,
                tables,
                heap,
                thread: Thread::new(config.max_call_depth),
                counter: InstructionCounter::default(),
            },
            history: History::new(&config),
            symbols,
            config,
        })
    }

    /// Looks a function up by module and name.
    pub fn function_index(&self, module: &str, name: &str) -> Option<FunctionIndex> {
        self.symbols.get(module)?.get(name).copied()
    }

    /// Enters `module.name` with `args`.
    ///
    /// Resets the counter and discards history; the heap keeps its
    /// contents.
    pub fn start(&mut self, module: &str, name: &str, args: &[WasmValue]) -> Result<(), VmError> {
        let index = self.function_index(module, name).ok_or(VmError::UnknownFunction)?;
        self.engine.thread.enter_function(&self.engine.functions, index, args)?;
        self.engine.counter = InstructionCounter::default();
        self.history.clear();
        debug!("started {}.{}", module, name);
        Ok(())
    }

    /// Executes one instruction.
    pub fn step(&mut self) -> Result<StepResult, VmError> {
        let outcome = self.engine.step(&mut self.history)?;
        self.history.after_step(&self.engine);
        Ok(match outcome {
            StepOutcome::Running => StepResult::Stepped,
            StepOutcome::Finished => StepResult::Finished,
            StepOutcome::Trapped(trap) => StepResult::Trapped(trap),
        })
    }

    /// Steps until the thread finishes or traps.
    pub fn step_until_finished(&mut self) -> Result<(), VmError> {
        while !self.engine.thread.is_finished() {
            self.step()?;
        }
        Ok(())
    }

    /// Executes one instruction, then fires the breakpoint registered at
    /// the instruction reached, if any.
    pub fn debug_step(&mut self) -> Result<StepResult, VmError> {
        let result = self.step()?;
        if result != StepResult::Stepped {
            return Ok(result);
        }
        let Some(frame) = self.engine.thread.top_frame() else {
            return Ok(result);
        };
        let hit = BreakpointHit {
            function: frame.function(),
            address: frame.ip(),
            counter: self.engine.counter,
        };
        let function = self.function(hit.function)?;
        if function.trigger_breakpoint(&hit) {
            debug!("breakpoint in {} at {:#x}", function.name(), hit.address);
            return Ok(StepResult::Breakpoint(hit));
        }
        Ok(result)
    }

    /// Debug-steps until a breakpoint fires or the thread stops.
    pub fn run_until_breakpoint(&mut self) -> Result<StepResult, VmError> {
        loop {
            match self.debug_step()? {
                StepResult::Stepped => {}
                other => return Ok(other),
            }
        }
    }

    /// Registers `handler` at the `node`-th instruction (pre-order) of
    /// `function`.
    pub fn add_breakpoint(
        &self,
        function: FunctionIndex,
        node: usize,
        handler: BreakpointHandler,
    ) -> Result<(), VmError> {
        let target = self.function(function)?;
        let address = target.address_of(node).ok_or(VmError::UnknownInstruction { node })?;
        target.add_breakpoint(address, handler);
        Ok(())
    }

    /// Returns whether a breakpoint was registered there.
    pub fn remove_breakpoint(&self, function: FunctionIndex, node: usize) -> Result<bool, VmError> {
        let target = self.function(function)?;
        let address = target.address_of(node).ok_or(VmError::UnknownInstruction { node })?;
        Ok(target.remove_breakpoint(address))
    }

    /// Starts recording with a checkpoint at the current counter.
    pub fn enable_history(&mut self) {
        self.history.add_checkpoint(&self.engine);
    }

    /// Moves the machine to `target`, backward or forward.
    pub fn simulate_to(&mut self, target: InstructionCounter) -> Result<(), HistoryError> {
        self.history.set_to_state(target, &mut self.engine)
    }

    /// Undoes the last instruction.
    pub fn step_back(&mut self) -> Result<(), HistoryError> {
        if self.history.state() == HistoryState::Disabled {
            return Err(HistoryError::NotEnabled);
        }
        match self.engine.counter.0.checked_sub(1) {
            Some(previous) => self.simulate_to(InstructionCounter(previous)),
            None => Err(HistoryError::AtStart),
        }
    }

    pub fn got_trap(&self) -> bool {
        self.engine.thread.got_trap()
    }

    /// Empty unless the thread trapped.
    pub fn trap_reason(&self) -> &str {
        self.engine.thread.trap_reason()
    }

    /// Return value of the entry function once it finished.
    pub fn result(&self) -> Option<WasmValue> {
        self.engine.thread.result()
    }

    pub fn is_finished(&self) -> bool {
        self.engine.thread.is_finished()
    }

    pub fn counter(&self) -> InstructionCounter {
        self.engine.counter
    }

    pub fn thread(&self) -> &Thread {
        &self.engine.thread
    }

    pub fn heap(&self) -> &Heap {
        &self.engine.heap
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn functions(&self) -> &[Arc<CompiledFunction>] {
        &self.engine.functions
    }

    fn function(&self, index: FunctionIndex) -> Result<&Arc<CompiledFunction>, VmError> {
        self.engine.functions.get(index.as_usize()).ok_or(VmError::UnknownFunction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DataSegment, Function, FunctionRef, Instruction as I, MemoryLimits, Module, Op};
    use crate::compiler::Linker;
    use crate::ops::{LoadOp, NumericOp, StoreOp};
    use crate::{FunctionSignature, WasmType};
    use alloc::boxed::Box;
    use alloc::vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn machine(modules: &[Module], config: MachineConfig) -> Machine {
        let mut linker = Linker::new();
        for module in modules {
            linker.add_module(module).unwrap();
        }
        Machine::new(linker.link().unwrap(), config).unwrap()
    }

    /// `local0 += 1` until it reaches 10, then returns it.
    fn counting() -> Function {
        Function::new(
            "count",
            FunctionSignature::new(&[], Some(WasmType::I32)),
            vec![WasmType::I32],
            vec![
                I::looped(
                    None,
                    vec![
                        I::local_set(0, I::binary(NumericOp::I32Add, I::local_get(0), I::i32_const(1))),
                        I::new(
                            Op::BranchIf { depth: 0 },
                            vec![I::binary(NumericOp::I32LtS, I::local_get(0), I::i32_const(10))],
                        ),
                    ],
                ),
                I::local_get(0),
            ],
        )
    }

    /// Stores `i` at `4 * i` for `i` in 0..4 through a helper call, then
    /// loads the last word back.
    fn storing() -> Module {
        let store = Function::new(
            "put",
            FunctionSignature::new(&[WasmType::I32], None),
            vec![],
            vec![I::store(
                StoreOp::I32Store,
                0,
                I::binary(NumericOp::I32Mul, I::local_get(0), I::i32_const(4)),
                I::local_get(0),
            )],
        );
        let put = FunctionRef::new("m", "put", FunctionSignature::new(&[WasmType::I32], None));
        let main = Function::new(
            "main",
            FunctionSignature::new(&[], Some(WasmType::I32)),
            vec![WasmType::I32],
            vec![
                I::looped(
                    None,
                    vec![
                        I::new(Op::Call(put), vec![I::local_get(0)]),
                        I::local_set(0, I::binary(NumericOp::I32Add, I::local_get(0), I::i32_const(1))),
                        I::new(
                            Op::BranchIf { depth: 0 },
                            vec![I::binary(NumericOp::I32LtS, I::local_get(0), I::i32_const(4))],
                        ),
                    ],
                ),
                I::load(LoadOp::I32Load, 12, I::i32_const(0)),
            ],
        );
        let mut module = Module::new("m").with_function(store).with_function(main);
        module.memory = Some(MemoryLimits { min_pages: 1, max_pages: Some(1) });
        module
    }

    #[test]
    fn test_runs_to_completion() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        m.start("m", "count", &[]).unwrap();
        m.step_until_finished().unwrap();
        assert!(m.is_finished());
        assert!(!m.got_trap());
        assert_eq!(m.trap_reason(), "");
        assert_eq!(m.result(), Some(WasmValue::I32(10)));
        assert!(m.counter() > InstructionCounter(10));
        assert_eq!(m.step(), Err(VmError::ThreadFinished));
    }

    #[test]
    fn test_start_errors() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        assert_eq!(m.start("m", "nope", &[]), Err(VmError::UnknownFunction));
        assert_eq!(
            m.start("m", "count", &[WasmValue::I32(1)]),
            Err(VmError::InvalidCallParameters)
        );
    }

    #[test]
    fn test_data_segments_and_memory_limits() {
        let mut module = Module::new("m");
        module.memory = Some(MemoryLimits { min_pages: 1, max_pages: Some(3) });
        module.data = vec![DataSegment { offset: 8, bytes: vec![1, 2, 3] }];
        let m = machine(&[module], MachineConfig::default());
        assert_eq!(m.heap().size(), PAGE_SIZE);
        assert_eq!(m.heap().max_size(), 3 * PAGE_SIZE);
        assert_eq!(m.heap().get_bytes(8, 3), Ok(&[1u8, 2, 3][..]));

        let mut module = Module::new("m");
        module.memory = Some(MemoryLimits { min_pages: 1, max_pages: None });
        module.data = vec![DataSegment { offset: PAGE_SIZE as u32 - 1, bytes: vec![1, 2] }];
        let mut linker = Linker::new();
        linker.add_module(&module).unwrap();
        assert!(matches!(
            Machine::new(linker.link().unwrap(), MachineConfig::default()),
            Err(VmError::Heap(_))
        ));
    }

    #[test]
    fn test_history_requires_enabling() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        m.start("m", "count", &[]).unwrap();
        m.step().unwrap();
        assert_eq!(m.step_back(), Err(HistoryError::NotEnabled));
        assert_eq!(m.simulate_to(InstructionCounter(0)), Err(HistoryError::NotEnabled));
    }

    #[test]
    fn test_rewind_matches_first_visit() {
        let config = MachineConfig { checkpoint_interval: 7, ..MachineConfig::default() };
        let mut m = machine(&[storing()], config);
        m.start("m", "main", &[]).unwrap();
        m.enable_history();

        let mut seen = vec![(m.thread().clone(), m.heap().clone())];
        while !m.is_finished() {
            m.step().unwrap();
            seen.push((m.thread().clone(), m.heap().clone()));
        }
        assert_eq!(m.result(), Some(WasmValue::I32(3)));
        assert!(m.history().checkpoint_count() > 2);

        let last = m.counter();
        for target in [3u64, 17, 0, 30, 30, 11] {
            let target = target.min(last.0);
            m.simulate_to(InstructionCounter(target)).unwrap();
            assert_eq!(m.counter(), InstructionCounter(target));
            let (thread, heap) = &seen[target as usize];
            assert_eq!(m.thread(), thread);
            assert_eq!(m.heap(), heap);
        }

        m.simulate_to(last).unwrap();
        assert_eq!(m.result(), Some(WasmValue::I32(3)));
        m.step_back().unwrap();
        assert_eq!(m.counter().0, last.0 - 1);
        assert!(!m.is_finished());
    }

    #[test]
    fn test_history_bounds() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        m.start("m", "count", &[]).unwrap();
        m.step().unwrap();
        m.step().unwrap();
        m.enable_history();
        m.step().unwrap();

        assert_eq!(
            m.simulate_to(InstructionCounter(50)),
            Err(HistoryError::TargetInFuture { target: 50, latest: 3 })
        );
        assert_eq!(
            m.simulate_to(InstructionCounter(1)),
            Err(HistoryError::TargetNotInHistory { target: 1, oldest: 2 })
        );
        m.simulate_to(InstructionCounter(2)).unwrap();
        assert_eq!(m.step_back(), Err(HistoryError::TargetNotInHistory { target: 1, oldest: 2 }));
    }

    #[test]
    fn test_history_limit_drops_oldest() {
        let config = MachineConfig { checkpoint_interval: 2, history_limit: 3, ..MachineConfig::default() };
        let mut m = machine(&[Module::new("m").with_function(counting())], config);
        m.start("m", "count", &[]).unwrap();
        m.enable_history();
        m.step_until_finished().unwrap();
        assert_eq!(m.history().checkpoint_count(), 3);
        assert!(m.history().oldest() > Some(InstructionCounter(0)));
        assert!(matches!(
            m.simulate_to(InstructionCounter(0)),
            Err(HistoryError::TargetNotInHistory { .. })
        ));
    }

    #[test]
    fn test_breakpoints_fire_after_step() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        let count = m.function_index("m", "count").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        // node 1 is the `local.set` heading the loop body
        m.add_breakpoint(
            count,
            1,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert_eq!(
            m.add_breakpoint(count, 99, Box::new(|_| {})),
            Err(VmError::UnknownInstruction { node: 99 })
        );

        m.start("m", "count", &[]).unwrap();
        let mut stops = 0;
        loop {
            match m.run_until_breakpoint().unwrap() {
                StepResult::Breakpoint(hit) => {
                    assert_eq!(hit.function, count);
                    assert_eq!(hit.counter, m.counter());
                    stops += 1;
                }
                StepResult::Finished => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        // once per iteration, right after the loop's label
        assert_eq!(stops, 10);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(m.result(), Some(WasmValue::I32(10)));

        assert_eq!(m.remove_breakpoint(count, 1), Ok(true));
        assert_eq!(m.remove_breakpoint(count, 1), Ok(false));
    }

    #[test]
    fn test_one_shot_breakpoint() {
        let mut m = machine(&[Module::new("m").with_function(counting())], MachineConfig::default());
        let count = m.function_index("m", "count").unwrap();
        let function = m.functions()[count.as_usize()].clone();
        m.add_breakpoint(
            count,
            1,
            Box::new(move |hit| {
                function.remove_breakpoint(hit.address);
            }),
        )
        .unwrap();

        m.start("m", "count", &[]).unwrap();
        assert!(matches!(m.run_until_breakpoint(), Ok(StepResult::Breakpoint(_))));
        assert_eq!(m.run_until_breakpoint(), Ok(StepResult::Finished));
        assert_eq!(m.result(), Some(WasmValue::I32(10)));
        assert_eq!(m.remove_breakpoint(count, 1), Ok(false));
    }
}
