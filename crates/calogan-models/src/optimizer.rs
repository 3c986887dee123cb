//! Named parameter sets and the Adam optimizer driving them.

use crate::convert::{array_to_tensor, tensor_to_array};
use crate::error::CandleResultExt;
use calogan_training::{Communicator, TrainingError, TrainingResult, WeightSet};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::VarMap;
use ndarray::{ArrayD, IxDyn};
use std::sync::Arc;

/// Trainable variables in a fixed, name-sorted order.
#[derive(Clone, Default)]
pub struct ParamSet {
    params: Vec<(String, Var)>,
}

impl std::fmt::Debug for ParamSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.params.iter().map(|(name, var)| (name, var.dims()))).finish()
    }
}

impl ParamSet {
    pub fn from_varmap(varmap: &VarMap) -> TrainingResult<Self> {
        let data = varmap.data().lock().map_err(|_| TrainingError::Model("parameter map poisoned".to_string()))?;
        let mut params: Vec<(String, Var)> = data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self { params })
    }

    /// `self` followed by `other`.
    #[must_use]
    pub fn chain(&self, other: &Self) -> Self {
        Self { params: self.params.iter().chain(&other.params).cloned().collect() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    pub(crate) fn vars(&self) -> impl Iterator<Item = &Var> {
        self.params.iter().map(|(_, var)| var)
    }

    pub fn snapshot(&self) -> TrainingResult<WeightSet> {
        Ok(WeightSet(self.vars().map(|v| tensor_to_array(v.as_tensor())).collect::<TrainingResult<_>>()?))
    }

    pub fn restore(&self, state: &WeightSet) -> TrainingResult<()> {
        if state.len() != self.len() {
            return Err(TrainingError::Shape(format!("expected {} weight arrays, got {}", self.len(), state.len())));
        }
        for ((name, var), array) in self.params.iter().zip(&state.0) {
            if var.dims() != array.shape() {
                return Err(TrainingError::Shape(format!(
                    "weight '{name}' has shape {:?}, checkpoint holds {:?}",
                    var.dims(),
                    array.shape()
                )));
            }
            var.set(&array_to_tensor(array, var.device())?).or_model_err()?;
        }
        Ok(())
    }
}

/// Learning rate and moment decay rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSettings {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

/// Adam with the Keras step-size correction
/// `lr_t = lr * sqrt(1 - beta2^t) / (1 - beta1^t)` and epsilon outside the root.
///
/// When a communicator with more than one rank is attached, gradients are
/// mean-reduced across ranks before every update.
pub struct Adam {
    params: ParamSet,
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    iterations: u64,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    comm: Option<Arc<dyn Communicator>>,
}

impl std::fmt::Debug for Adam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adam")
            .field("params", &self.params.len())
            .field("lr", &self.lr)
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl Adam {
    pub fn new(params: ParamSet, settings: AdamSettings, comm: Option<Arc<dyn Communicator>>) -> TrainingResult<Self> {
        let AdamSettings { lr, beta1, beta2, epsilon } = settings;
        let zeros = |var: &Var| Tensor::zeros(var.dims(), DType::F32, var.device());
        let m = params.vars().map(zeros).collect::<candle_core::Result<Vec<_>>>().or_model_err()?;
        let v = params.vars().map(zeros).collect::<candle_core::Result<Vec<_>>>().or_model_err()?;
        let comm = comm.filter(|c| c.size() > 1);
        Ok(Self { params, lr, beta1, beta2, epsilon, iterations: 0, m, v, comm })
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    #[must_use]
    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    /// Gradient of every parameter, zero where the loss does not depend on it.
    fn collect_gradients(&self, grads: &GradStore) -> TrainingResult<Vec<Tensor>> {
        self.params
            .vars()
            .map(|var| match grads.get(var.as_tensor()) {
                Some(g) => Ok(g.clone()),
                None => var.zeros_like(),
            })
            .collect::<candle_core::Result<Vec<_>>>()
            .or_model_err()
    }

    fn average_gradients(&self, comm: &dyn Communicator, gradients: Vec<Tensor>) -> TrainingResult<Vec<Tensor>> {
        let arrays = gradients.iter().map(tensor_to_array).collect::<TrainingResult<Vec<_>>>()?;
        let shaped = WeightSet(arrays);
        let mut flat = shaped.flatten();
        comm.allreduce_mean(&mut flat)?;
        let reduced = shaped.unflatten_like(&flat)?;
        reduced
            .0
            .iter()
            .zip(&gradients)
            .map(|(array, g)| array_to_tensor(array, g.device()))
            .collect()
    }

    pub fn step(&mut self, grads: &GradStore) -> TrainingResult<()> {
        let mut gradients = self.collect_gradients(grads)?;
        if let Some(comm) = &self.comm {
            gradients = self.average_gradients(comm.as_ref(), gradients)?;
        }

        self.iterations += 1;
        let t = self.iterations as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));

        for (i, (var, g)) in self.params.vars().zip(&gradients).enumerate() {
            let m = (self.m[i].affine(self.beta1, 0.0).or_model_err()? + g.affine(1.0 - self.beta1, 0.0).or_model_err()?)
                .or_model_err()?;
            let v = (self.v[i].affine(self.beta2, 0.0).or_model_err()?
                + g.sqr().and_then(|g2| g2.affine(1.0 - self.beta2, 0.0)).or_model_err()?)
            .or_model_err()?;
            let update = v
                .sqrt()
                .and_then(|root| root.affine(1.0, self.epsilon))
                .and_then(|denom| m.div(&denom))
                .and_then(|ratio| ratio.affine(lr_t, 0.0))
                .or_model_err()?;
            let next = var.as_tensor().sub(&update).or_model_err()?;
            var.set(&next).or_model_err()?;
            self.m[i] = m;
            self.v[i] = v;
        }
        Ok(())
    }

    /// `[iterations, m..., v...]`.
    pub fn snapshot(&self) -> TrainingResult<WeightSet> {
        let mut arrays = Vec::with_capacity(1 + 2 * self.m.len());
        arrays.push(ArrayD::from_shape_vec(IxDyn(&[1]), vec![self.iterations as f32])?);
        for slot in self.m.iter().chain(&self.v) {
            arrays.push(tensor_to_array(slot)?);
        }
        Ok(WeightSet(arrays))
    }

    pub fn restore(&mut self, state: &WeightSet) -> TrainingResult<()> {
        let n = self.m.len();
        if state.len() != 1 + 2 * n {
            return Err(TrainingError::Shape(format!(
                "optimizer state for {n} parameters needs {} arrays, got {}",
                1 + 2 * n,
                state.len()
            )));
        }
        let expected = self.snapshot()?;
        expected.check_compatible(state)?;

        let iterations = state.0[0].iter().next().copied().unwrap_or_default();
        let device = self.params.vars().next().map(|v| v.device().clone()).unwrap_or(candle_core::Device::Cpu);
        let slots = state.0[1..].iter().map(|a| array_to_tensor(a, &device)).collect::<TrainingResult<Vec<_>>>()?;
        let (m, v) = slots.split_at(n);
        self.m = m.to_vec();
        self.v = v.to_vec();
        self.iterations = iterations.max(0.0) as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calogan_training::LocalGroup;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};
    use std::thread;

    const SETTINGS: AdamSettings = AdamSettings { lr: 0.1, beta1: 0.5, beta2: 0.999, epsilon: 1e-7 };

    fn single_param(value: f32) -> (VarMap, ParamSet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(2, "w", Init::Const(f64::from(value))).unwrap();
        let params = ParamSet::from_varmap(&varmap).unwrap();
        (varmap, params)
    }

    fn values(params: &ParamSet) -> Vec<f32> {
        params.snapshot().unwrap().flatten()
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let (_map, params) = single_param(1.0);
        let mut adam = Adam::new(params.clone(), SETTINGS, None).unwrap();
        let var = params.vars().next().unwrap().clone();
        let loss = var.as_tensor().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();
        // the first Keras step has magnitude ~lr regardless of gradient scale
        for w in values(&params) {
            assert!((w - 0.9).abs() < 1e-4, "{w}");
        }
        assert_eq!(adam.iterations(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let (_map, params) = single_param(1.0);
        let mut adam = Adam::new(params.clone(), SETTINGS, None).unwrap();
        let var = params.vars().next().unwrap().clone();
        adam.step(&var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()).unwrap();
        let state = adam.snapshot().unwrap();
        assert_eq!(state.len(), 3);
        assert_eq!(state.0[0].iter().next(), Some(&1.0));

        let (_other_map, other_params) = single_param(1.0);
        let mut fresh = Adam::new(other_params, SETTINGS, None).unwrap();
        fresh.restore(&state).unwrap();
        assert_eq!(fresh.snapshot().unwrap(), state);
        assert!(fresh.restore(&WeightSet::default()).is_err());
    }

    #[test]
    fn test_param_restore_checks_shapes() {
        let (_map, params) = single_param(0.0);
        let good = WeightSet(vec![ArrayD::from_elem(IxDyn(&[2]), 3.0)]);
        params.restore(&good).unwrap();
        assert_eq!(values(&params), vec![3.0, 3.0]);
        let bad = WeightSet(vec![ArrayD::from_elem(IxDyn(&[3]), 3.0)]);
        assert!(params.restore(&bad).is_err());
    }

    #[test]
    fn test_gradients_are_averaged_across_ranks() {
        // rank 0 sees gradient +1, rank 1 sees -1: the mean is 0 and nothing moves
        let group = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let comm: Arc<dyn Communicator> = Arc::new(member);
                    let sign = if comm.rank() == 0 { 1.0 } else { -1.0 };
                    let (_map, params) = single_param(1.0);
                    let mut adam = Adam::new(params.clone(), SETTINGS, Some(comm)).unwrap();
                    let var = params.vars().next().unwrap().clone();
                    let loss = var.as_tensor().affine(sign, 0.0).unwrap().sum_all().unwrap();
                    adam.step(&loss.backward().unwrap()).unwrap();
                    values(&params)
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 1.0]);
        }
    }
}
