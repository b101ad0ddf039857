pub mod core;
pub mod entities;
pub mod imports;
pub mod setup;
