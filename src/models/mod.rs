pub mod drops;
pub mod mining;
pub mod queue;
pub mod settings;
pub mod stream;
pub mod user;
