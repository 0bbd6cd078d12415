//! Dead operation elimination
//!
//! Removes operations whose value nobody uses, as long as they are free of
//! effects (see [`Opcode::is_removable_if_unused`]). Liveness starts at the
//! effectful operations and the terminators and flows backwards through
//! operands, so unused phi cycles are removed too. Surviving operations are
//! renumbered in block order.

use tracing::debug;

use crate::error::{PassError, Result};
use crate::ir::{Graph, GraphBuilder, OpIndex, Terminator};

/// Rebuild `graph` without its dead operations; returns the number removed
pub fn eliminate_dead_operations(graph: &Graph) -> Result<(Graph, usize)> {
    let mut live = vec![false; graph.op_count()];
    let mut worklist: Vec<OpIndex> = Vec::new();

    let mark = |value: OpIndex, live: &mut Vec<bool>, worklist: &mut Vec<OpIndex>| {
        if let Some(slot) = live.get_mut(value.index()) {
            if !*slot {
                *slot = true;
                worklist.push(value);
            }
        }
    };

    for block in &graph.blocks {
        for &op in &block.operations {
            if !graph.op(op).opcode.is_removable_if_unused() {
                mark(op, &mut live, &mut worklist);
            }
        }
        for value in block.terminator.inputs() {
            mark(value, &mut live, &mut worklist);
        }
    }
    while let Some(op) = worklist.pop() {
        let Some(operation) = graph.get(op) else {
            continue;
        };
        for value in operation.opcode.inputs() {
            mark(value, &mut live, &mut worklist);
        }
    }

    // Builder indices follow emission order, so new indices can be assigned up front.
    let mut new_index: Vec<Option<OpIndex>> = vec![None; graph.op_count()];
    let mut next = 0u32;
    for block in &graph.blocks {
        for &op in &block.operations {
            if live[op.index()] {
                new_index[op.index()] = Some(OpIndex(next));
                next += 1;
            }
        }
    }
    let lookup = |value: OpIndex| new_index.get(value.index()).copied().flatten();
    let remap = |user: OpIndex, value: OpIndex| -> Result<OpIndex> {
        lookup(value).ok_or(PassError::undefined_value(user, value))
    };
    let remap_terminator = |value: OpIndex| -> Result<OpIndex> {
        lookup(value)
            .ok_or_else(|| PassError::malformed(format!("terminator uses undefined value {value}")))
    };

    let mut builder = GraphBuilder::with_explicit_predecessors();
    for block_index in graph.block_indices() {
        let block = graph.block(block_index);
        let new_block = if block_index.index() == 0 {
            builder.current_block()
        } else {
            builder.new_block()
        };
        builder.bind(new_block);
        builder.set_predecessors(new_block, block.predecessors.clone());
        for &op in &block.operations {
            if live[op.index()] {
                let opcode = graph.op(op).opcode.try_map_inputs(|value| remap(op, value))?;
                builder.emit(opcode);
            }
        }
        let terminator = match &block.terminator {
            Terminator::Branch {
                condition,
                if_true,
                if_false,
            } => Terminator::Branch {
                condition: remap_terminator(*condition)?,
                if_true: *if_true,
                if_false: *if_false,
            },
            Terminator::Return(Some(value)) => Terminator::Return(Some(remap_terminator(*value)?)),
            other => other.clone(),
        };
        builder.terminate(terminator);
    }

    let removed = graph.op_count() - next as usize;
    if removed > 0 {
        debug!(removed, "dead operations removed");
    }
    Ok((builder.finish(), removed))
}
