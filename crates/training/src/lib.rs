pub mod checkpoint;
pub mod config;
pub mod data;
pub mod history;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod registry;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{BatchLoader, TensorBatch};
pub use history::TrainingHistory;
pub use loss::{LossMetrics, LossOutput, SpacedCrossEntropy};
pub use model::Recognizer;
pub use optimizer::{AdamW, OptimizerState};
pub use trainer::Trainer;
