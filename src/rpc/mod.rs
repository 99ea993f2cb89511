pub mod server;

pub use server::{RpcState, start_api_server};
