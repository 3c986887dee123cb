//! Moving data between `ndarray` containers and tensors.

use crate::error::CandleResultExt;
use calogan_training::{ShowerImages, TrainingError, TrainingResult};
use candle_core::{Device, Tensor};
use ndarray::{Array1, Array2, Array3, ArrayD, IxDyn};

fn contiguous<T: Clone>(values: impl Iterator<Item = T>) -> Vec<T> {
    values.collect()
}

/// `[n]` values as an `[n, 1]` column.
pub(crate) fn column(values: &Array1<f32>, device: &Device) -> TrainingResult<Tensor> {
    Tensor::from_vec(contiguous(values.iter().copied()), (values.len(), 1), device).or_model_err()
}

pub(crate) fn class_ids(values: &Array1<u32>, device: &Device) -> TrainingResult<Tensor> {
    Tensor::from_vec(contiguous(values.iter().copied()), values.len(), device).or_model_err()
}

pub(crate) fn matrix(values: &Array2<f32>, device: &Device) -> TrainingResult<Tensor> {
    Tensor::from_vec(contiguous(values.iter().copied()), values.dim(), device).or_model_err()
}

pub(crate) fn images_to_tensors(images: &ShowerImages, device: &Device) -> TrainingResult<[Tensor; 3]> {
    let [a, b, c] = &images.layers;
    let lift = |layer: &Array3<f32>| Tensor::from_vec(contiguous(layer.iter().copied()), layer.dim(), device);
    Ok([lift(a).or_model_err()?, lift(b).or_model_err()?, lift(c).or_model_err()?])
}

pub(crate) fn tensors_to_images(layers: &[Tensor; 3]) -> TrainingResult<ShowerImages> {
    let lower = |t: &Tensor| -> TrainingResult<Array3<f32>> {
        let dims = t.dims3().or_model_err()?;
        let values = t.flatten_all().and_then(|f| f.to_vec1::<f32>()).or_model_err()?;
        Ok(Array3::from_shape_vec(dims, values)?)
    };
    ShowerImages::new([lower(&layers[0])?, lower(&layers[1])?, lower(&layers[2])?])
}

pub(crate) fn tensor_to_array(t: &Tensor) -> TrainingResult<ArrayD<f32>> {
    let values = t.flatten_all().and_then(|f| f.to_vec1::<f32>()).or_model_err()?;
    Ok(ArrayD::from_shape_vec(IxDyn(t.dims()), values)?)
}

pub(crate) fn array_to_tensor(array: &ArrayD<f32>, device: &Device) -> TrainingResult<Tensor> {
    Tensor::from_vec(contiguous(array.iter().copied()), array.shape(), device).or_model_err()
}

/// `[n, k]` tensor back to a matrix.
pub(crate) fn tensor_to_matrix(t: &Tensor) -> TrainingResult<Array2<f32>> {
    let dims = t.dims2().or_model_err()?;
    let values = t.flatten_all().and_then(|f| f.to_vec1::<f32>()).or_model_err()?;
    Ok(Array2::from_shape_vec(dims, values)?)
}

pub(crate) fn tensor_to_vector(t: &Tensor) -> TrainingResult<Array1<f32>> {
    let values = t.flatten_all().and_then(|f| f.to_vec1::<f32>()).or_model_err()?;
    Ok(Array1::from(values))
}

pub(crate) fn scalar(t: &Tensor) -> TrainingResult<f32> {
    let value = t.to_scalar::<f32>().or_model_err()?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainingError::Model(format!("non-finite loss {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, arr1};

    #[test]
    fn test_images_keep_row_major_layout() {
        let images = ShowerImages::new([
            Array3::from_shape_fn((2, 1, 3), |(b, _, c)| (b * 10 + c) as f32),
            Array3::from_shape_fn((2, 2, 2), |(b, r, c)| (b * 100 + r * 2 + c) as f32),
            Array3::zeros((2, 1, 1)),
        ])
        .unwrap();
        let tensors = images_to_tensors(&images, &Device::Cpu).unwrap();
        assert_eq!(tensors[1].dims(), &[2, 2, 2]);
        assert_eq!(tensors_to_images(&tensors).unwrap(), images);
    }

    #[test]
    fn test_column_shape_and_scalar_check() {
        let c = column(&arr1(&[1.0, 2.0, 3.0]), &Device::Cpu).unwrap();
        assert_eq!(c.dims(), &[3, 1]);
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        assert!(scalar(&nan).is_err());
    }
}
