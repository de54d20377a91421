pub mod controller;

pub use controller::{Monitor, MonitorNotice};
