pub mod interface;
pub mod file_interface;
pub mod log_interface;
