pub mod commands;
pub mod extract;
pub mod fence;
pub mod recorder;
pub mod scheduler;
pub mod submit;
