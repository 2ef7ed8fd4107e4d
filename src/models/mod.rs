pub mod cluster;
pub mod status;
pub mod views;
