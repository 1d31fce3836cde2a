#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
mod event;
mod user;

pub use self::{
    error::Error,
    event::{Event, EventStream, Status},
    user::UserInfo,
};

/// The api group under which the projected views are served.
pub const CLUSTERVIEW_API_GROUP: &str = "clusterview.open-cluster-management.io";
