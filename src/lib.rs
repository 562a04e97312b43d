pub mod availability;
pub mod calendar;
pub mod config;
pub mod duration;
pub mod error;
pub mod generator;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod offers;
pub mod reaper;
pub mod scheduler;
pub mod slot_finder;
pub mod store;
pub mod timer;
pub mod wal;
