pub mod fixture;
pub mod scripted_process;
pub mod wait_utils;
