//! Differentiable building-block ops
//!
//! The minimum arithmetic the stitcher needs: element-wise addition (summing
//! multiple received activations), element-wise multiplication, scaling, and
//! reduction to a scalar. Forwards run eagerly; each helper records a node
//! holding only the backward rule.

use candle_core::Tensor;

use crate::error::Result;
use crate::graph::{Op, Variable};

/// `a + b`, element-wise. Shapes must match.
pub fn add(a: &Variable, b: &Variable) -> Result<Variable> {
    let data = (a.data() + b.data())?;
    Ok(Variable::from_op(data, Box::new(AddOp), vec![a.clone(), b.clone()]))
}

/// `a * b`, element-wise. Shapes must match.
pub fn mul(a: &Variable, b: &Variable) -> Result<Variable> {
    let data = (a.data() * b.data())?;
    Ok(Variable::from_op(data, Box::new(MulOp), vec![a.clone(), b.clone()]))
}

/// `x * factor`.
pub fn scale(x: &Variable, factor: f64) -> Result<Variable> {
    let data = x.data().affine(factor, 0.0)?;
    Ok(Variable::from_op(data, Box::new(ScaleOp { factor }), vec![x.clone()]))
}

/// Sum of all elements, producing a scalar.
pub fn sum_all(x: &Variable) -> Result<Variable> {
    let data = x.data().sum_all()?;
    Ok(Variable::from_op(data, Box::new(SumAllOp), vec![x.clone()]))
}

struct AddOp;

impl Op for AddOp {
    fn name(&self) -> &'static str {
        "add"
    }

    fn backward(&self, _inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad.clone()), Some(grad.clone())])
    }
}

struct MulOp;

impl Op for MulOp {
    fn name(&self) -> &'static str {
        "mul"
    }

    fn backward(&self, inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let da = (grad * inputs[1].data())?;
        let db = (grad * inputs[0].data())?;
        Ok(vec![Some(da), Some(db)])
    }
}

struct ScaleOp {
    factor: f64,
}

impl Op for ScaleOp {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn backward(&self, _inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad.affine(self.factor, 0.0)?)])
    }
}

struct SumAllOp;

impl Op for SumAllOp {
    fn name(&self) -> &'static str {
        "sum_all"
    }

    fn backward(&self, inputs: &[Variable], grad: &Tensor) -> Result<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad.broadcast_as(inputs[0].data().shape())?)])
    }
}
