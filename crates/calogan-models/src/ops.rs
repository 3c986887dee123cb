//! Building blocks shared by the generator and the discriminator.

use calogan_training::LayerShape;
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder, linear_no_bias};

/// Negative slope of the hidden-layer activations.
pub const HIDDEN_LEAK: f64 = 0.2;
/// Negative slope of the optional last generator activation.
pub const LAST_LEAK: f64 = 0.3;

pub fn leaky_relu(x: &Tensor, alpha: f64) -> Result<Tensor> {
    let positive = x.relu()?;
    let negative = x.neg()?.relu()?.affine(alpha, 0.0)?;
    positive - negative
}

/// `log(1 + exp(x))` without overflow for large `x`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Mean binary cross-entropy on logits.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let per_example = (softplus(logits)? - logits.mul(targets)?)?;
    per_example.mean_all()
}

/// Mean absolute error.
pub fn mean_absolute_error(predicted: &Tensor, targets: &Tensor) -> Result<Tensor> {
    predicted.sub(targets)?.abs()?.mean_all()
}

/// Integer rescaling along one image axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rescale {
    Keep,
    Repeat(usize),
    Pool(usize),
}

impl Rescale {
    #[must_use]
    pub fn between(from: usize, to: usize) -> Option<Self> {
        if from == 0 || to == 0 {
            return None;
        }
        if from == to {
            Some(Self::Keep)
        } else if to % from == 0 {
            Some(Self::Repeat(to / from))
        } else if from % to == 0 {
            Some(Self::Pool(from / to))
        } else {
            None
        }
    }
}

/// Maps one layer's image grid onto another's by row/column upsampling and average pooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub rows: Rescale,
    pub cols: Rescale,
}

impl ResizePlan {
    #[must_use]
    pub fn new(from: LayerShape, to: LayerShape) -> Option<Self> {
        Some(Self { rows: Rescale::between(from.0, to.0)?, cols: Rescale::between(from.1, to.1)? })
    }

    /// `x` is `[batch, rows, cols]`.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (b, h, w) = x.dims3()?;
        let x = match self.rows {
            Rescale::Keep => x.clone(),
            Rescale::Repeat(k) => x.unsqueeze(2)?.broadcast_as((b, h, k, w))?.reshape((b, h * k, w))?,
            Rescale::Pool(k) => x.reshape((b, h / k, k, w))?.mean(2)?,
        };
        let (b, h, w) = x.dims3()?;
        match self.cols {
            Rescale::Keep => Ok(x),
            Rescale::Repeat(k) => x.unsqueeze(3)?.broadcast_as((b, h, w, k))?.reshape((b, h, w * k)),
            Rescale::Pool(k) => x.reshape((b, h, w / k, k))?.mean(3),
        }
    }
}

/// Per-pixel gate mixing a layer's own image with one carried over from the previous layer.
///
/// `gate = sigmoid(a * primary + b * carry + c)`, output `primary * (1 - gate) + carry * gate`.
/// The bias starts at -10, so the gate starts closed.
#[derive(Debug, Clone)]
pub struct InpaintingAttention {
    primary_kernel: Tensor,
    carry_kernel: Tensor,
    bias: Tensor,
}

impl InpaintingAttention {
    pub const BIAS_INIT: f64 = -10.0;

    pub fn new(shape: LayerShape, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            primary_kernel: vb.get_with_hints(shape, "primary_kernel", Init::Const(1.0))?,
            carry_kernel: vb.get_with_hints(shape, "carry_kernel", Init::Const(1.0))?,
            bias: vb.get_with_hints(shape, "bias", Init::Const(Self::BIAS_INIT))?,
        })
    }

    pub fn forward(&self, primary: &Tensor, carry: &Tensor) -> Result<Tensor> {
        let logits = primary
            .broadcast_mul(&self.primary_kernel)?
            .add(&carry.broadcast_mul(&self.carry_kernel)?)?
            .broadcast_add(&self.bias)?;
        let gate = candle_nn::ops::sigmoid(&logits)?;
        let keep = gate.affine(-1.0, 1.0)?;
        primary.mul(&keep)? + carry.mul(&gate)?
    }
}

/// `sum_j exp(-||x_i - x_j||_1)` per feature, for `x` of shape `[batch, features, vspace]`.
pub fn minibatch_features(x: &Tensor) -> Result<Tensor> {
    let left = x.unsqueeze(3)?;
    let right = x.permute((1, 2, 0))?.unsqueeze(0)?;
    let l1 = left.broadcast_sub(&right)?.abs()?.sum(2)?;
    l1.neg()?.exp()?.sum(2)
}

/// Minibatch discrimination: project, then compare every example with the whole batch.
#[derive(Debug, Clone)]
pub struct MinibatchDiscrimination {
    kernel: Linear,
    features: usize,
    vspace: usize,
}

impl MinibatchDiscrimination {
    pub fn new(in_dim: usize, features: usize, vspace: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self { kernel: linear_no_bias(in_dim, features * vspace, vb.pp("dense3d"))?, features, vspace })
    }

    /// `[batch, in_dim]` to `[batch, features]`, squashed with tanh.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let b = x.dim(0)?;
        let projected = self.kernel.forward(x)?.reshape((b, self.features, self.vspace))?;
        minibatch_features(&projected)?.tanh()
    }
}

/// Energy-conservation inputs to the discriminator.
#[derive(Debug, Clone)]
pub struct EnergyFeatures {
    /// `[batch, 3]` summed deposit per layer.
    pub energies: Tensor,
    /// `[batch, 1]`.
    pub total: Tensor,
    /// `[batch, 1]` absolute deviation from the conditioning energy.
    pub well: Tensor,
    /// `[batch, 1]` 10 where the deviation exceeds 5 GeV, else 0.
    pub too_big: Tensor,
}

pub const WELL_TOLERANCE: f32 = 5.0;

pub fn energy_features(layers: &[Tensor; 3], input_energy: &Tensor) -> Result<EnergyFeatures> {
    let per_layer = layers.iter().map(|l| l.flatten_from(1)?.sum_keepdim(1)).collect::<Result<Vec<_>>>()?;
    let energies = Tensor::cat(&per_layer, 1)?;
    let total = energies.sum_keepdim(1)?;
    let well = total.sub(input_energy)?.abs()?;
    let tolerance = Tensor::full(WELL_TOLERANCE, well.dims(), well.device())?;
    let too_big = well.gt(&tolerance)?.to_dtype(DType::F32)?.affine(10.0, 0.0)?;
    Ok(EnergyFeatures { energies, total, well, too_big })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn t(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-4, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_activations() {
        let x = t(&[-2.0, 0.0, 3.0], &[3]);
        close(&leaky_relu(&x, 0.2).unwrap().to_vec1::<f32>().unwrap(), &[-0.4, 0.0, 3.0]);
        let sp = softplus(&t(&[-100.0, 0.0, 100.0], &[3])).unwrap().to_vec1::<f32>().unwrap();
        close(&sp, &[0.0, std::f32::consts::LN_2, 100.0]);
    }

    #[test]
    fn test_bce_with_logits_matches_definition() {
        let logits = t(&[0.5, -1.0], &[2, 1]);
        let targets = t(&[1.0, 0.0], &[2, 1]);
        let got = bce_with_logits(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        let p = |x: f32| 1.0 / (1.0 + (-x).exp());
        let want = (-(p(0.5)).ln() - (1.0 - p(-1.0)).ln()) / 2.0;
        assert!((got - want).abs() < 1e-5);

        // no overflow for saturated logits
        let big = bce_with_logits(&t(&[500.0], &[1, 1]), &t(&[0.0], &[1, 1])).unwrap();
        assert!((big.to_scalar::<f32>().unwrap() - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_rescale_between() {
        assert_eq!(Rescale::between(3, 12), Some(Rescale::Repeat(4)));
        assert_eq!(Rescale::between(96, 12), Some(Rescale::Pool(8)));
        assert_eq!(Rescale::between(12, 12), Some(Rescale::Keep));
        assert_eq!(Rescale::between(5, 12), None);
    }

    #[test]
    fn test_resize_first_to_second_layer() {
        let plan = ResizePlan::new((3, 96), (12, 12)).unwrap();
        let x = Tensor::ones((2, 3, 96), DType::F32, &Device::Cpu).unwrap();
        let y = plan.apply(&x).unwrap();
        assert_eq!(y.dims(), &[2, 12, 12]);
        close(&y.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[1.0; 2 * 144]);

        let plan = ResizePlan::new((12, 12), (12, 6)).unwrap();
        let x = t(&(0..144).map(|i| (i % 2) as f32).collect::<Vec<_>>(), &[1, 12, 12]);
        let y = plan.apply(&x).unwrap();
        assert_eq!(y.dims(), &[1, 12, 6]);
        close(&y.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[0.5; 72]);
    }

    #[test]
    fn test_row_repeat_copies_rows() {
        let plan = ResizePlan { rows: Rescale::Repeat(2), cols: Rescale::Keep };
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2]);
        let y = plan.apply(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        close(&y, &[1.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn test_attention_starts_closed() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attention = InpaintingAttention::new((2, 2), vb).unwrap();
        let primary = t(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 2]);
        let carry = t(&[0.5; 4], &[1, 2, 2]);
        let out = attention.forward(&primary, &carry).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (o, p) in out.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((o - p).abs() < 0.01, "{out:?}");
        }
    }

    #[test]
    fn test_minibatch_features_identical_examples() {
        // three identical examples: every distance is 0, so each feature sums to 3
        let x = Tensor::ones((3, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let f = minibatch_features(&x).unwrap();
        assert_eq!(f.dims(), &[3, 2]);
        close(&f.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[3.0; 6]);
    }

    #[test]
    fn test_energy_features() {
        let layers = [
            Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu).unwrap(),
            Tensor::ones((2, 2, 2), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros((2, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        ];
        let input = t(&[6.0, 20.0], &[2, 1]);
        let f = energy_features(&layers, &input).unwrap();
        close(&f.energies.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[2.0, 4.0, 0.0, 2.0, 4.0, 0.0]);
        close(&f.total.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[6.0, 6.0]);
        close(&f.well.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[0.0, 14.0]);
        close(&f.too_big.flatten_all().unwrap().to_vec1::<f32>().unwrap(), &[0.0, 10.0]);
    }
}
