//! # Reversible Execution Tests
//!
//! Rewinding must land on exactly the state first observed at a counter,
//! however it is reached and however often it is repeated.

use wave_vm::ast::{FunctionRef, MemoryLimits};
use wave_vm::{
    Function, FunctionSignature, Heap, HistoryError, Instruction as I, InstructionCounter, Linker,
    LoadOp, Machine, MachineConfig, Module, NumericOp, Op, StoreOp, WasmType, WasmValue,
};
use wave_vm::thread::Thread;

fn sig(params: &[WasmType], result: Option<WasmType>) -> FunctionSignature {
    FunctionSignature::new(params, result)
}

fn machine(module: Module, config: MachineConfig) -> Machine {
    let mut linker = Linker::new();
    linker.add_module(&module).unwrap();
    Machine::new(linker.link().unwrap(), config).unwrap()
}

/// Sums `mem[4 * i]` for `i` in 0..n after writing `i * i` there through
/// a callee, growing memory by a page half way through.
fn squares() -> Module {
    let put_sig = sig(&[WasmType::I32], None);
    let put = Function::new(
        "put",
        put_sig.clone(),
        vec![],
        vec![I::store(
            StoreOp::I32Store,
            0,
            I::binary(NumericOp::I32Mul, I::local_get(0), I::i32_const(4)),
            I::binary(NumericOp::I32Mul, I::local_get(0), I::local_get(0)),
        )],
    );
    let main = Function::new(
        "main",
        sig(&[WasmType::I32], Some(WasmType::I32)),
        // i, sum
        vec![WasmType::I32, WasmType::I32],
        vec![
            I::looped(
                None,
                vec![
                    I::new(Op::Call(FunctionRef::new("m", "put", put_sig)), vec![I::local_get(1)]),
                    I::new(
                        Op::If(None),
                        vec![
                            I::binary(NumericOp::I32Eq, I::local_get(1), I::i32_const(2)),
                            I::new(Op::Drop, vec![I::new(Op::MemoryGrow, vec![I::i32_const(1)])]),
                        ],
                    ),
                    I::local_set(
                        2,
                        I::binary(
                            NumericOp::I32Add,
                            I::local_get(2),
                            I::load(
                                LoadOp::I32Load,
                                0,
                                I::binary(NumericOp::I32Mul, I::local_get(1), I::i32_const(4)),
                            ),
                        ),
                    ),
                    I::local_set(1, I::binary(NumericOp::I32Add, I::local_get(1), I::i32_const(1))),
                    I::new(
                        Op::BranchIf { depth: 0 },
                        vec![I::binary(NumericOp::I32LtS, I::local_get(1), I::local_get(0))],
                    ),
                ],
            ),
            I::local_get(2),
        ],
    );
    let mut module = Module::new("m").with_function(put).with_function(main);
    module.memory = Some(MemoryLimits { min_pages: 1, max_pages: Some(4) });
    module
}

/// Runs to completion, recording the state seen at every counter.
fn record(machine: &mut Machine) -> Vec<(Thread, Heap)> {
    let mut seen = vec![(machine.thread().clone(), machine.heap().clone())];
    while !machine.is_finished() {
        machine.step().unwrap();
        seen.push((machine.thread().clone(), machine.heap().clone()));
    }
    seen
}

fn assert_at(machine: &Machine, seen: &[(Thread, Heap)], counter: u64) {
    let (thread, heap) = &seen[counter as usize];
    assert_eq!(machine.counter(), InstructionCounter(counter));
    assert_eq!(machine.thread(), thread, "thread differs at {}", counter);
    assert!(machine.heap() == heap, "heap differs at {}", counter);
}

#[test]
fn step_back_walks_every_instruction() {
    let mut m = machine(squares(), MachineConfig { checkpoint_interval: 16, ..MachineConfig::default() });
    m.start("m", "main", &[WasmValue::I32(5)]).unwrap();
    m.enable_history();
    let seen = record(&mut m);
    assert_eq!(m.result(), Some(WasmValue::I32(1 + 4 + 9 + 16)));
    assert_eq!(m.heap().pages(), 2);

    let last = m.counter().0;
    for counter in (0..last).rev() {
        m.step_back().unwrap();
        assert_at(&m, &seen, counter);
    }
    assert_eq!(m.step_back(), Err(HistoryError::AtStart));
}

#[test]
fn set_to_state_is_idempotent() {
    let mut m = machine(squares(), MachineConfig { checkpoint_interval: 9, ..MachineConfig::default() });
    m.start("m", "main", &[WasmValue::I32(4)]).unwrap();
    m.enable_history();
    let seen = record(&mut m);
    let last = m.counter().0;

    for target in [last / 2, last / 3, last / 3, last - 1, 0, 0, last, 5] {
        m.simulate_to(InstructionCounter(target)).unwrap();
        assert_at(&m, &seen, target);
        m.simulate_to(InstructionCounter(target)).unwrap();
        assert_at(&m, &seen, target);
    }
}

#[test]
fn rewinding_undoes_a_trap() {
    let f = Function::new(
        "f",
        sig(&[WasmType::I32], Some(WasmType::I32)),
        vec![],
        vec![I::binary(NumericOp::I32DivU, I::i32_const(10), I::local_get(0))],
    );
    let mut m = machine(Module::new("m").with_function(f), MachineConfig::default());
    m.start("m", "f", &[WasmValue::I32(0)]).unwrap();
    m.enable_history();
    m.step_until_finished().unwrap();
    assert!(m.got_trap());
    let trapped_at = m.counter();

    m.step_back().unwrap();
    assert!(!m.got_trap());
    assert!(!m.is_finished());
    assert_eq!(m.trap_reason(), "");
    assert_eq!(m.thread().depth(), 1);

    m.simulate_to(trapped_at).unwrap();
    assert_eq!(m.trap_reason(), "integer divide by zero");
}

#[test]
fn history_errors() {
    let mut m = machine(squares(), MachineConfig::default());
    m.start("m", "main", &[WasmValue::I32(2)]).unwrap();
    assert_eq!(m.step_back(), Err(HistoryError::NotEnabled));

    m.step().unwrap();
    m.enable_history();
    m.step_until_finished().unwrap();
    let last = m.counter().0;

    assert_eq!(
        m.simulate_to(InstructionCounter(last + 1)),
        Err(HistoryError::TargetInFuture { target: last + 1, latest: last })
    );
    assert_eq!(
        m.simulate_to(InstructionCounter(0)),
        Err(HistoryError::TargetNotInHistory { target: 0, oldest: 1 })
    );
    // failed requests leave the machine where it was
    assert_eq!(m.counter().0, last);
    assert_eq!(m.result(), Some(WasmValue::I32(1)));
}

#[test]
fn restarting_discards_history() {
    let mut m = machine(squares(), MachineConfig::default());
    m.start("m", "main", &[WasmValue::I32(1)]).unwrap();
    m.enable_history();
    m.step_until_finished().unwrap();
    assert!(m.history().is_recording());

    m.start("m", "main", &[WasmValue::I32(1)]).unwrap();
    assert!(!m.history().is_recording());
    assert_eq!(m.history().checkpoint_count(), 0);
    assert_eq!(m.counter(), InstructionCounter(0));
}
