use calogan_training::{TrainingError, TrainingResult};

/// Lift tensor-library failures into the training error type.
pub(crate) trait CandleResultExt<T> {
    fn or_model_err(self) -> TrainingResult<T>;
}

impl<T> CandleResultExt<T> for candle_core::Result<T> {
    fn or_model_err(self) -> TrainingResult<T> {
        self.map_err(|e| TrainingError::Model(e.to_string()))
    }
}
