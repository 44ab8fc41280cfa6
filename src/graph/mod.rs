//! Autodiff collaborator interface
//!
//! The stitcher consumes a narrow slice of an autodiff engine: create a
//! tensor node with a given creator, query or replace a node's creator,
//! override a node's scheduling priority, and run backward from a node.
//! This module carries that interface concretely so composed multi-rank
//! graphs are executable.
//!
//! Forward values are computed eagerly by constructor helpers (see [`ops`]);
//! a [`Node`] only records how to push gradients back through one step. The
//! backward engine drains creators from a max-heap keyed on each node's
//! `rank` — the ordinary, settable evaluate-after hint. By default a node's
//! rank is its topological depth, so gradients flow in reverse creation
//! order; forcing a rank of -1 defers that node until every other ready node
//! has run, which is how cross-process communication ops are sequenced.

pub mod ops;

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Rank value that forces a node to evaluate last among ready nodes.
pub const RANK_LAST: i64 = -1;

static NODE_IDS: AtomicUsize = AtomicUsize::new(0);

/// One backward step of a recorded operation.
pub trait Op {
    fn name(&self) -> &'static str;

    /// Given the forward inputs and the gradient flowing into this node's
    /// output, produce the gradient contribution for each input (`None` for
    /// inputs that receive no gradient).
    fn backward(&self, inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>>;
}

/// A creator node in the computation graph: the op that produced a variable
/// together with the variables it consumed and its scheduling rank.
pub struct Node {
    id: usize,
    op: Box<dyn Op>,
    inputs: Vec<Variable>,
    rank: Cell<i64>,
}

impl Node {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn op_name(&self) -> &'static str {
        self.op.name()
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    /// Current scheduling rank. Higher ranks run their backward earlier.
    pub fn rank(&self) -> i64 {
        self.rank.get()
    }

    /// Override the scheduling rank. Setting [`RANK_LAST`] defers this
    /// node's backward until all other ready nodes have drained.
    pub fn set_rank(&self, rank: i64) {
        self.rank.set(rank);
    }
}

struct VarInner {
    data: Tensor,
    grad: RefCell<Option<Tensor>>,
    creator: RefCell<Option<Rc<Node>>>,
}

/// A tensor value participating in the local computation graph.
///
/// Cloning is shallow; clones share data, gradient slot, and creator.
#[derive(Clone)]
pub struct Variable {
    inner: Rc<VarInner>,
}

impl Variable {
    /// A leaf variable with no creator (an input or a parameter).
    pub fn new(data: Tensor) -> Self {
        Self {
            inner: Rc::new(VarInner {
                data,
                grad: RefCell::new(None),
                creator: RefCell::new(None),
            }),
        }
    }

    /// A variable produced by `op` applied to `inputs`. The node's rank is
    /// one past the deepest input, preserving reverse creation order until
    /// someone overrides it.
    pub fn from_op(data: Tensor, op: Box<dyn Op>, inputs: Vec<Variable>) -> Self {
        let rank = inputs.iter().map(Variable::rank).max().unwrap_or(0) + 1;
        let node = Rc::new(Node {
            id: NODE_IDS.fetch_add(1, AtomicOrdering::Relaxed),
            op,
            inputs,
            rank: Cell::new(rank),
        });
        Self {
            inner: Rc::new(VarInner {
                data,
                grad: RefCell::new(None),
                creator: RefCell::new(Some(node)),
            }),
        }
    }

    pub fn data(&self) -> &Tensor {
        &self.inner.data
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.inner.grad.borrow().clone()
    }

    pub fn set_grad(&self, grad: Tensor) {
        *self.inner.grad.borrow_mut() = Some(grad);
    }

    /// Add a gradient contribution to whatever has accumulated so far.
    pub fn accumulate_grad(&self, grad: Tensor) -> Result<()> {
        let mut slot = self.inner.grad.borrow_mut();
        let next = match slot.take() {
            Some(acc) => (&acc + &grad)?,
            None => grad,
        };
        *slot = Some(next);
        Ok(())
    }

    pub fn creator(&self) -> Option<Rc<Node>> {
        self.inner.creator.borrow().clone()
    }

    /// Replace this variable's producer.
    pub fn set_creator(&self, node: Option<Rc<Node>>) {
        *self.inner.creator.borrow_mut() = node;
    }

    /// Scheduling rank of the creator; leaves are rank 0.
    pub fn rank(&self) -> i64 {
        self.creator().map(|n| n.rank()).unwrap_or(0)
    }

    /// Whether two handles refer to the same graph node.
    pub fn same_variable(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run backward from this variable, seeding its gradient with ones if
    /// none has been set.
    pub fn backward(&self) -> Result<()> {
        backward(self)
    }
}

struct Pending {
    rank: i64,
    seq: usize,
    node: Rc<Node>,
    out: Variable,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank).then(self.seq.cmp(&other.seq))
    }
}

/// Backward pass from `root`.
///
/// Creators are drained highest-rank-first; a node is scheduled once, when
/// the first gradient for its output arrives, and reads its accumulated
/// output gradient when popped. Rank ordering guarantees every consumer of
/// a variable has contributed before the variable's own creator runs.
pub fn backward(root: &Variable) -> Result<()> {
    if root.grad().is_none() {
        let ones = Tensor::ones(
            root.data().shape(),
            root.data().dtype(),
            root.data().device(),
        )?;
        root.set_grad(ones);
    }

    let mut heap = BinaryHeap::new();
    let mut scheduled = HashSet::new();
    let mut seq = 0usize;

    if let Some(node) = root.creator() {
        scheduled.insert(node.id());
        heap.push(Pending { rank: node.rank(), seq, node, out: root.clone() });
    }

    while let Some(Pending { node, out, .. }) = heap.pop() {
        let Some(grad_out) = out.grad() else {
            continue;
        };
        let grads = node.op.backward(node.inputs(), &grad_out)?;
        if grads.len() != node.inputs().len() {
            return Err(Error::Protocol(format!(
                "op '{}' returned {} gradients for {} inputs",
                node.op_name(),
                grads.len(),
                node.inputs().len()
            )));
        }
        for (input, grad) in node.inputs().iter().zip(grads) {
            let Some(grad) = grad else { continue };
            input.accumulate_grad(grad)?;
            if let Some(creator) = input.creator() {
                if scheduled.insert(creator.id()) {
                    seq += 1;
                    heap.push(Pending {
                        rank: creator.rank(),
                        seq,
                        node: creator,
                        out: input.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
