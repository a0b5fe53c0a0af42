use comms::{
    msg::{Rank, Tensor},
    specs::segment::{ActFnSpec, LayerSpec, OptimizerSpec, SegmentSpec},
};
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng, distr::Uniform, rngs::StdRng};

use super::{Result, TrainErr, Trainer};

#[derive(Clone, Debug)]
struct Sigmoid {
    amp: f32,
}

impl Sigmoid {
    fn f(&self, z: f32) -> f32 {
        self.amp / (1. + (-z).exp())
    }

    fn df(&self, z: f32) -> f32 {
        let amp = self.amp;

        (amp * (-z).exp()) / ((-z).exp() + 1.).powi(2)
    }
}

/// A fully connected layer computing `act_fn(x · w + b)`.
struct Dense {
    w: Array2<f32>,
    b: Array1<f32>,
    act_fn: Option<Sigmoid>,

    // Forward metadata, only kept while training
    x: Option<Array2<f32>>,
    z: Option<Array2<f32>>,
}

impl Dense {
    fn new(w: Array2<f32>, b: Array1<f32>, act_fn: Option<Sigmoid>) -> Self {
        Self {
            w,
            b,
            act_fn,
            x: None,
            z: None,
        }
    }

    /// Xavier uniform initialization, biases start at zero.
    fn random<R: Rng>(dim: (usize, usize), act_fn: Option<Sigmoid>, rng: &mut R) -> Result<Self> {
        let limit = (6. / (dim.0 + dim.1) as f32).sqrt();
        let dist = Uniform::new(-limit, limit).map_err(|e| TrainErr::InvalidSpec(e.to_string()))?;
        let w = Array2::from_shape_fn(dim, |_| rng.sample(&dist));

        Ok(Self::new(w, Array1::zeros(dim.1), act_fn))
    }

    fn in_dim(&self) -> usize {
        self.w.nrows()
    }

    fn out_dim(&self) -> usize {
        self.w.ncols()
    }

    fn forward(&mut self, x: Array2<f32>, cache: bool) -> Array2<f32> {
        let z = x.dot(&self.w) + &self.b;

        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        if cache {
            self.x = Some(x);
            self.z = Some(z);
        }

        a
    }

    /// Backpropagates `d`, steps the parameters and returns the gradient w.r.t. the input.
    fn backward(&mut self, mut d: Array2<f32>, learning_rate: f32) -> Result<Array2<f32>> {
        let (Some(x), Some(z)) = (self.x.take(), self.z.take()) else {
            return Err(TrainErr::MissingForward);
        };

        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&z, |d, &z| *d *= act_fn.df(z));
        }

        let dx = d.dot(&self.w.t());
        let dw = x.t().dot(&d);
        let db = d.sum_axis(Axis(0));

        self.w.scaled_add(-learning_rate, &dw);
        self.b.scaled_add(-learning_rate, &db);

        Ok(dx)
    }

    fn forget(&mut self) {
        self.x = None;
        self.z = None;
    }
}

/// The facilitator's middle model segment, a stack of dense layers trained with
/// gradient descent.
pub struct SegmentTrainer {
    layers: Vec<Dense>,
    learning_rate: f32,
    training: bool,
    pending_rows: Option<usize>,
}

impl SegmentTrainer {
    fn new(layers: Vec<Dense>, learning_rate: f32) -> Self {
        Self {
            layers,
            learning_rate,
            training: true,
            pending_rows: None,
        }
    }

    /// Builds a randomly initialized segment from its specification.
    ///
    /// # Errors
    /// Returns `TrainErr::InvalidSpec` if there are no layers, a layer has a zero
    /// width, consecutive layers don't chain or the learning rate isn't positive.
    pub fn from_spec(spec: &SegmentSpec) -> Result<Self> {
        let OptimizerSpec::GradientDescent { learning_rate } = spec.optimizer;
        if !(learning_rate.is_finite() && learning_rate > 0.) {
            return Err(TrainErr::InvalidSpec(format!(
                "learning rate must be positive, got {learning_rate}"
            )));
        }

        if spec.layers.is_empty() {
            return Err(TrainErr::InvalidSpec("the segment has no layers".into()));
        }

        for (i, pair) in spec.layers.windows(2).enumerate() {
            let (out, next_in) = (pair[0].dim().1, pair[1].dim().0);
            if out != next_in {
                return Err(TrainErr::InvalidSpec(format!(
                    "layer {i} outputs {out} values but layer {} takes {next_in}",
                    i + 1
                )));
            }
        }

        let mut rng = match spec.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let layers = spec
            .layers
            .iter()
            .map(|layer| {
                let LayerSpec::Dense { dim, act_fn } = *layer;
                if dim.0 == 0 || dim.1 == 0 {
                    return Err(TrainErr::InvalidSpec(format!("layer of dim {dim:?}")));
                }

                let act_fn = act_fn.map(|ActFnSpec::Sigmoid { amp }| Sigmoid { amp });
                Dense::random(dim, act_fn, &mut rng)
            })
            .collect::<Result<_>>()?;

        Ok(Self::new(layers, learning_rate))
    }

    /// The width of the activations this segment takes.
    pub fn in_dim(&self) -> usize {
        self.layers.first().map(Dense::in_dim).unwrap_or_default()
    }

    /// The width of the activations this segment produces.
    pub fn out_dim(&self) -> usize {
        self.layers.last().map(Dense::out_dim).unwrap_or_default()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

fn to_array(what: &'static str, tensor: &Tensor<'_>) -> Result<Array2<f32>> {
    Array2::from_shape_vec(tensor.shape(), tensor.data().to_vec()).map_err(|_| {
        TrainErr::ShapeMismatch {
            what,
            got: (tensor.data().len(), 1),
            expected: tensor.shape(),
        }
    })
}

fn to_tensor(a: Array2<f32>) -> Result<Tensor<'static>> {
    let (rows, cols) = a.dim();
    let data: Vec<f32> = a.iter().copied().collect();
    let len = data.len();

    Tensor::new(rows, cols, data).map_err(|_| TrainErr::ShapeMismatch {
        what: "output",
        got: (len, 1),
        expected: (rows, cols),
    })
}

impl Trainer for SegmentTrainer {
    fn forward_pass(
        &mut self,
        acts: Tensor<'_>,
        rank_info: &[Rank],
    ) -> Result<(Tensor<'static>, Vec<Rank>)> {
        if acts.cols() != self.in_dim() {
            return Err(TrainErr::ShapeMismatch {
                what: "activations",
                got: acts.shape(),
                expected: (acts.rows(), self.in_dim()),
            });
        }

        let cache = self.training;
        let mut a = to_array("activations", &acts)?;
        for layer in &mut self.layers {
            a = layer.forward(a, cache);
        }

        self.pending_rows = cache.then_some(acts.rows());
        Ok((to_tensor(a)?, rank_info.to_vec()))
    }

    fn backward_pass(&mut self, grads: Tensor<'_>) -> Result<Tensor<'static>> {
        if !self.training {
            return Err(TrainErr::EvalMode);
        }

        let rows = self.pending_rows.take().ok_or(TrainErr::MissingForward)?;
        let expected = (rows, self.out_dim());
        if grads.shape() != expected {
            return Err(TrainErr::ShapeMismatch {
                what: "gradients",
                got: grads.shape(),
                expected,
            });
        }

        let learning_rate = self.learning_rate;
        let mut d = to_array("gradients", &grads)?;
        for layer in self.layers.iter_mut().rev() {
            d = layer.backward(d, learning_rate)?;
        }

        to_tensor(d)
    }

    fn enter_eval_mode(&mut self) -> Result<()> {
        self.training = false;
        self.pending_rows = None;
        self.layers.iter_mut().for_each(Dense::forget);
        Ok(())
    }

    fn end_validation(&mut self) -> Result<()> {
        self.training = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn identity_segment(learning_rate: f32) -> SegmentTrainer {
        let dense = Dense::new(Array2::eye(2), Array1::zeros(2), None);
        SegmentTrainer::new(vec![dense], learning_rate)
    }

    fn spec(layers: Vec<LayerSpec>, learning_rate: f32) -> SegmentSpec {
        SegmentSpec {
            layers,
            optimizer: OptimizerSpec::GradientDescent { learning_rate },
            seed: Some(3),
        }
    }

    fn dense(dim: (usize, usize)) -> LayerSpec {
        LayerSpec::Dense {
            dim,
            act_fn: Some(ActFnSpec::Sigmoid { amp: 1.0 }),
        }
    }

    #[test]
    fn builds_chained_layers() {
        let trainer = SegmentTrainer::from_spec(&spec(vec![dense((4, 8)), dense((8, 3))], 0.1)).unwrap();
        assert_eq!((trainer.in_dim(), trainer.out_dim()), (4, 3));
        assert!(trainer.is_training());
    }

    #[test]
    fn rejects_invalid_specs() {
        let unchained = spec(vec![dense((4, 8)), dense((7, 3))], 0.1);
        let empty = spec(vec![], 0.1);
        let zero_width = spec(vec![dense((0, 2))], 0.1);
        let negative_lr = spec(vec![dense((4, 8))], -1.0);

        for spec in [unchained, empty, zero_width, negative_lr] {
            assert!(matches!(
                SegmentTrainer::from_spec(&spec),
                Err(TrainErr::InvalidSpec(_))
            ));
        }
    }

    #[test]
    fn forward_keeps_rank_info_and_shape() {
        let mut trainer = SegmentTrainer::from_spec(&spec(vec![dense((3, 5))], 0.1)).unwrap();
        let acts = Tensor::new(2, 3, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();

        let (out, rank_info) = trainer.forward_pass(acts, &[2, 9]).unwrap();

        assert_eq!(out.shape(), (2, 5));
        assert_eq!(rank_info, vec![2, 9]);
        assert!(out.data().iter().all(|a| (0.0..=1.0).contains(a)));
    }

    #[test]
    fn backward_returns_input_gradient_and_steps_params() {
        let mut trainer = identity_segment(0.5);

        let (out, _) = trainer.forward_pass(Tensor::row(vec![1.0, 2.0]), &[]).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0]);

        let dx = trainer.backward_pass(Tensor::row(vec![1.0, 1.0])).unwrap();
        assert_eq!(dx.data(), &[1.0, 1.0]);

        // w = I - 0.5 * [[1, 1], [2, 2]], b = -0.5 * [1, 1]
        let (out, _) = trainer.forward_pass(Tensor::row(vec![1.0, 0.0]), &[]).unwrap();
        assert_eq!(out.data(), &[0.0, -1.0]);

        let layer = &trainer.layers[0];
        assert_eq!(layer.w, array![[0.5, -0.5], [-1.0, 0.0]]);
    }

    #[test]
    fn eval_mode_freezes_the_segment() {
        let mut trainer = identity_segment(0.5);
        trainer.forward_pass(Tensor::row(vec![1.0, 2.0]), &[]).unwrap();
        trainer.enter_eval_mode().unwrap();

        let (out, _) = trainer.forward_pass(Tensor::row(vec![3.0, 4.0]), &[]).unwrap();
        assert_eq!(out.data(), &[3.0, 4.0]);
        assert!(matches!(
            trainer.backward_pass(Tensor::row(vec![1.0, 1.0])),
            Err(TrainErr::EvalMode)
        ));

        trainer.end_validation().unwrap();
        assert!(matches!(
            trainer.backward_pass(Tensor::row(vec![1.0, 1.0])),
            Err(TrainErr::MissingForward)
        ));
        assert_eq!(trainer.layers[0].w, Array2::<f32>::eye(2));
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let mut trainer = identity_segment(0.5);

        assert!(matches!(
            trainer.forward_pass(Tensor::row(vec![1.0, 2.0, 3.0]), &[]),
            Err(TrainErr::ShapeMismatch { what: "activations", .. })
        ));

        trainer.forward_pass(Tensor::new(2, 2, vec![1.0; 4]).unwrap(), &[]).unwrap();
        assert!(matches!(
            trainer.backward_pass(Tensor::row(vec![1.0, 1.0])),
            Err(TrainErr::ShapeMismatch { what: "gradients", .. })
        ));
    }
}
