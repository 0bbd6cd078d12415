//! Block visitation order and dominance
//!
//! Reverse postorder visits every block after all of its predecessors
//! except those reaching it over a back edge. A block with such a
//! predecessor is a loop header.

use super::{BlockIndex, Graph};

/// Reverse postorder of the blocks reachable from the entry
#[derive(Debug, Clone)]
pub struct BlockOrder {
    order: Vec<BlockIndex>,
    position: Vec<Option<usize>>,
}

impl BlockOrder {
    pub fn compute(graph: &Graph) -> Self {
        let count = graph.block_count();
        let mut visited = vec![false; count];
        let mut postorder = Vec::with_capacity(count);
        // (block, index of the next successor to explore)
        let mut stack: Vec<(BlockIndex, usize)> = Vec::new();

        if count > 0 {
            visited[BlockIndex::ENTRY.index()] = true;
            stack.push((BlockIndex::ENTRY, 0));
        }
        while let Some((block, next)) = stack.last_mut() {
            let successors = graph.block(*block).terminator.successors();
            // Last successor first, so a branch's true target comes first in the order.
            if let Some(&successor) = successors.iter().rev().nth(*next) {
                *next += 1;
                if successor.index() < count && !visited[successor.index()] {
                    visited[successor.index()] = true;
                    stack.push((successor, 0));
                }
            } else {
                postorder.push(*block);
                stack.pop();
            }
        }

        postorder.reverse();
        let mut position = vec![None; count];
        for (i, block) in postorder.iter().enumerate() {
            position[block.index()] = Some(i);
        }
        Self {
            order: postorder,
            position,
        }
    }

    pub fn blocks(&self) -> &[BlockIndex] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self, block: BlockIndex) -> Option<usize> {
        self.position.get(block.index()).copied().flatten()
    }

    pub fn is_reachable(&self, block: BlockIndex) -> bool {
        self.position(block).is_some()
    }

    /// The edge `from -> to` closes a cycle (both reachable)
    pub fn is_back_edge(&self, from: BlockIndex, to: BlockIndex) -> bool {
        match (self.position(from), self.position(to)) {
            (Some(from), Some(to)) => from >= to,
            _ => false,
        }
    }

    pub fn is_loop_header(&self, graph: &Graph, block: BlockIndex) -> bool {
        graph
            .block(block)
            .predecessors
            .iter()
            .any(|&pred| self.is_back_edge(pred, block))
    }
}

/// Immediate dominators of the reachable blocks
#[derive(Debug, Clone)]
pub struct Dominators {
    idom: Vec<Option<BlockIndex>>,
    position: Vec<Option<usize>>,
}

impl Dominators {
    /// Iterative dominance (Cooper, Harvey and Kennedy) over reverse postorder
    pub fn compute(graph: &Graph, order: &BlockOrder) -> Self {
        let count = graph.block_count();
        let mut idom: Vec<Option<BlockIndex>> = vec![None; count];
        let position: Vec<Option<usize>> = (0..count as u32)
            .map(|b| order.position(BlockIndex(b)))
            .collect();
        if order.is_empty() {
            return Self { idom, position };
        }
        idom[BlockIndex::ENTRY.index()] = Some(BlockIndex::ENTRY);

        let intersect = |idom: &[Option<BlockIndex>], mut a: BlockIndex, mut b: BlockIndex| {
            while a != b {
                while position[a.index()] > position[b.index()] {
                    a = idom[a.index()].unwrap_or(BlockIndex::ENTRY);
                }
                while position[b.index()] > position[a.index()] {
                    b = idom[b.index()].unwrap_or(BlockIndex::ENTRY);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &block in order.blocks().iter().skip(1) {
                let mut new_idom: Option<BlockIndex> = None;
                for &pred in &graph.block(block).predecessors {
                    if idom.get(pred.index()).copied().flatten().is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => intersect(&idom, pred, current),
                    });
                }
                if new_idom.is_some() && idom[block.index()] != new_idom {
                    idom[block.index()] = new_idom;
                    changed = true;
                }
            }
        }

        Self { idom, position }
    }

    pub fn immediate_dominator(&self, block: BlockIndex) -> Option<BlockIndex> {
        if block == BlockIndex::ENTRY {
            return None;
        }
        self.idom.get(block.index()).copied().flatten()
    }

    /// `a` dominates `b` (reflexive); false if either is unreachable
    pub fn dominates(&self, a: BlockIndex, b: BlockIndex) -> bool {
        if self.position.get(a.index()).copied().flatten().is_none() {
            return false;
        }
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            match self.immediate_dominator(cursor) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GraphBuilder;

    /// B0 -> B1 (header) -> B2 (body) -> B1, B1 -> B3 (exit)
    fn loop_graph() -> crate::ir::Graph {
        let mut b = GraphBuilder::new();
        let header = b.new_block();
        let body = b.new_block();
        let exit = b.new_block();
        let c = b.word32_constant(1);
        b.goto(header);
        b.bind(header);
        b.branch(c, body, exit);
        b.bind(body);
        b.goto(header);
        b.bind(exit);
        b.ret(None);
        b.finish()
    }

    #[test]
    fn test_reverse_postorder_visits_predecessors_first() {
        let graph = loop_graph();
        let order = BlockOrder::compute(&graph);
        assert_eq!(order.blocks()[0], BlockIndex(0));
        assert!(order.position(BlockIndex(1)) < order.position(BlockIndex(2)));
        assert!(order.position(BlockIndex(1)) < order.position(BlockIndex(3)));
    }

    #[test]
    fn test_loop_header_detection() {
        let graph = loop_graph();
        let order = BlockOrder::compute(&graph);
        assert!(order.is_loop_header(&graph, BlockIndex(1)));
        assert!(!order.is_loop_header(&graph, BlockIndex(2)));
        assert!(order.is_back_edge(BlockIndex(2), BlockIndex(1)));
    }

    #[test]
    fn test_unreachable_blocks_are_excluded() {
        let mut b = GraphBuilder::new();
        let dead = b.new_block();
        b.ret(None);
        b.bind(dead);
        b.ret(None);
        let graph = b.finish();
        let order = BlockOrder::compute(&graph);
        assert_eq!(order.len(), 1);
        assert!(!order.is_reachable(dead));
    }

    #[test]
    fn test_dominators() {
        let graph = loop_graph();
        let order = BlockOrder::compute(&graph);
        let dom = Dominators::compute(&graph, &order);
        assert!(dom.dominates(BlockIndex(1), BlockIndex(2)));
        assert!(dom.dominates(BlockIndex(1), BlockIndex(3)));
        assert!(!dom.dominates(BlockIndex(2), BlockIndex(3)));
        assert_eq!(dom.immediate_dominator(BlockIndex(3)), Some(BlockIndex(1)));
    }
}
