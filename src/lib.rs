pub mod approval;
pub mod declaration;
pub mod observability;
pub mod params;
pub mod pipeline;
pub mod presets;
pub mod provision;
pub mod report;
pub mod runner;
pub mod stages;
pub mod storage;
pub mod validation;

pub use declaration::Declaration;
pub use pipeline::{PipelineExecutor, PipelineResult, RunOutcome, StageRegistry};
pub use provision::{ProvisionRequest, provision};
