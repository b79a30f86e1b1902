pub mod event;
pub mod file_id;
pub mod harvester;

pub use event::Event;
pub use file_id::FileId;
pub use harvester::{
    CloseReason, HarvestSummary, Harvester, HarvesterConfig, HarvesterControl, HarvesterError,
    HarvesterPhase,
};
