pub mod codec;
pub mod config;
pub mod node;
pub mod raft;
pub mod rpc_client;
pub mod rpc_server;
pub mod state;
pub mod twophase;
