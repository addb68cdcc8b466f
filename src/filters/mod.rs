pub mod orientation;
pub mod pdr;
pub mod reliability;

pub use orientation::{OrientationEstimator, OrientationState, OrientationStats};
pub use pdr::{CalibrationOutcome, PdrState, PedestrianDeadReckoning, StepEvent};
pub use reliability::ReliabilityMonitor;
