#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use dubbo_authority_cert as cert;
pub use dubbo_authority_core as core;
pub use dubbo_authority_grpc as grpc;
pub use dubbo_authority_k8s_api as k8s;
pub use dubbo_authority_k8s_index as index;
pub use dubbo_authority_rule as rule;

mod args;
mod authority;
mod lease;
mod server;

pub use self::args::Args;
