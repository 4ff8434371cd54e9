//! Basic blocks recovered from analysis records, and their GraphViz rendering.

use crate::analysis::{AnalysisRecord, OpType};
use crate::containers::unordered::UnorderedSet;

use itertools::Itertools;

/// Why control moves from one block to another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum EdgeKind {
    /// Taken transfer
    Jump,
    /// Transfer not taken, or return from a call
    Fail,
    /// Straight-line execution into the next block
    FallThrough,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BasicBlock {
    pub start: u64,
    /// Address just past the last instruction
    pub end: u64,
    pub instructions: Vec<(u64, OpType)>,
    pub successors: Vec<(u64, EdgeKind)>,
}

impl BasicBlock {
    fn starting_with(r: &AnalysisRecord) -> Self {
        let mut b = Self {
            start: r.address,
            end: r.address,
            instructions: vec![],
            successors: vec![],
        };
        b.push(r);
        b
    }

    fn push(&mut self, r: &AnalysisRecord) {
        self.instructions.push((r.address, r.op_type));
        self.end = r.next_address();
        self.successors = successors(r);
    }
}

fn ends_block(r: &AnalysisRecord) -> bool {
    r.eob
        || matches!(
            r.op_type,
            OpType::Jmp | OpType::IJmp | OpType::CJmp | OpType::Ret | OpType::CRet | OpType::Unknown
        )
}

/// Successors of a block ending with `r`. Calls are assumed to return to their fail address.
fn successors(r: &AnalysisRecord) -> Vec<(u64, EdgeKind)> {
    let jump = r.jump.map(|j| (j, EdgeKind::Jump));
    let fail = r.fail.map(|f| (f, EdgeKind::Fail));
    match r.op_type {
        OpType::Unknown | OpType::Ret => vec![],
        OpType::Jmp | OpType::IJmp => jump.into_iter().collect(),
        OpType::CJmp | OpType::CRet => jump.into_iter().chain(fail).collect(),
        OpType::Call | OpType::ICall | OpType::CCall => fail.into_iter().collect(),
        OpType::Null | OpType::Nop | OpType::Sar if !r.eob => {
            vec![(r.next_address(), EdgeKind::FallThrough)]
        }
        OpType::Null | OpType::Nop | OpType::Sar => vec![],
    }
}

/// A control-flow graph over one listing's worth of analysis records.
#[derive(Clone, Debug)]
pub struct ControlFlowGraph {
    /// Sorted by start address
    blocks: Vec<BasicBlock>,
}

impl ControlFlowGraph {
    pub fn build(records: &[AnalysisRecord]) -> Self {
        let records = records.iter().sorted_by_key(|r| r.address).collect_vec();
        let known: UnorderedSet<u64> = records.iter().map(|r| r.address).collect();

        let mut leaders: UnorderedSet<u64> = records.first().map(|r| r.address).into_iter().collect();
        for r in &records {
            if let Some(target) = r.jump.filter(|t| known.contains(t)) {
                leaders.insert(target);
            }
            if ends_block(r) {
                leaders.insert(r.next_address());
            }
        }

        let mut blocks: Vec<BasicBlock> = vec![];
        for r in records {
            match blocks.last_mut() {
                Some(b) if b.end == r.address && !leaders.contains(&r.address) => b.push(r),
                _ => blocks.push(BasicBlock::starting_with(r)),
            }
        }
        Self { blocks }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block_at(&self, start: u64) -> Option<&BasicBlock> {
        self.blocks
            .binary_search_by_key(&start, |b| b.start)
            .ok()
            .map(|i| &self.blocks[i])
    }

    /// Write the graph in GraphViz `.dot` format. Targets outside the graph are drawn as plain
    /// text nodes.
    pub fn write_dot<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        type Node = u64;
        type Edge = (Node, Node, EdgeKind);

        struct Graph<'a> {
            cfg: &'a ControlFlowGraph,
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("ControlFlow").unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("b{:x}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                match self.cfg.block_at(*n) {
                    Some(b) => dot::LabelText::escaped(format!(
                        "{}\\l",
                        b.instructions
                            .iter()
                            .map(|(a, t)| format!("{:#x} {}", a, t))
                            .join("\\l")
                    )),
                    None => dot::LabelText::label(format!("{:#x}", n)),
                }
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                match self.cfg.block_at(*n) {
                    Some(_) => Some(dot::LabelText::label("box")),
                    None => Some(dot::LabelText::label("plaintext")),
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(match e.2 {
                    EdgeKind::Jump => "jump",
                    EdgeKind::Fail => "fail",
                    EdgeKind::FallThrough => "",
                })
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.cfg
                    .blocks
                    .iter()
                    .flat_map(|b| {
                        std::iter::once(b.start).chain(b.successors.iter().map(|(t, _)| *t))
                    })
                    .sorted()
                    .dedup()
                    .collect_vec()
                    .into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.cfg
                    .blocks
                    .iter()
                    .flat_map(|b| b.successors.iter().map(move |(t, k)| (b.start, *t, *k)))
                    .collect_vec()
                    .into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&Graph { cfg: self }, w)
    }

    /// Generate a `.dot` file representing this graph
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        // Writing into a `Vec` cannot fail
        self.write_dot(&mut s).unwrap_or_default();
        String::from_utf8_lossy(&s).into_owned()
    }
}
