pub mod call;
pub mod client;
pub mod queue;

pub use call::{MethodCode, RosApiCall};
pub use client::MasterCallClient;
pub use queue::ApiCallQueue;
