pub mod ack;
pub mod blocks;
pub mod config;
pub mod dbstate;
pub mod error;
pub mod execute;
pub mod messages;
pub mod node;
pub mod process_list;
mod round;
pub mod state;
pub mod storage;
pub mod types;
