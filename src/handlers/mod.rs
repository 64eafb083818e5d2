pub mod access;
pub mod commands;
pub mod responses;
pub mod uploads;
