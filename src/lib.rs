pub mod blocks;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod training;
pub mod ynet;

pub use config::TrainingConfig;
pub use evaluate::{Evaluator, TestReport};
pub use training::{Trainer, TrainingHistory};
pub use ynet::{YNet, YNetConfig};
