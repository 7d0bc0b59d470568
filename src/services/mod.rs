pub mod archive;
pub mod file_service;
pub mod key_generator;
pub mod listing;
pub mod part_planner;
pub mod transfer;
pub mod validation;

pub use file_service::FileService;
pub use transfer::TransferCoordinator;
