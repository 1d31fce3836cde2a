#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use clusterview_core as core;
pub use clusterview_k8s_api as k8s;
pub use clusterview_k8s_index as index;

mod api;
mod args;

pub use self::{api::Api, args::Args};
