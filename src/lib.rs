pub mod config;
pub mod error;
pub mod follower;
pub mod hal;
pub mod motor;
pub mod runtime;
pub mod sensor;
