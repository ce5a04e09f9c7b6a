pub mod codec;
pub mod fields;
pub mod setting;
pub mod state;
