pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod session;
pub mod trainer;

pub use config::{Backend, FacilitatorConfig};
pub use error::{FacilitatorErr, Result, Violation};
pub use manager::FacilitatorManager;
pub use metrics::FacilitatorMetrics;
pub use session::Phase;
pub use trainer::{SegmentTrainer, TrainErr, Trainer};
