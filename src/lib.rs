pub mod cli;
pub mod daemon;
pub mod errors;
pub mod models;
pub mod options;
pub mod process;
pub mod server;
pub mod sites;
pub mod storage;
