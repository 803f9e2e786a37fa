pub mod command;
pub mod scripted;
pub mod stub;

pub use command::CommandBackend;
pub use scripted::{ScriptStep, ScriptedBackend};
pub use stub::SimulatedWalkerBackend;
