pub mod cgroup;
pub mod channel;
pub mod config;
pub mod filesystem;
pub mod image;
pub mod init;
pub mod launcher;
pub mod network;
pub mod runtime;

// Re-export the main types and entry points for easier testing
pub use config::ContainerConfig;
pub use image::pull;
pub use runtime::run_container;
