#![forbid(unsafe_code)]

pub mod active_object;
pub mod bucket;
pub mod correlator;
pub mod dedup;
pub mod dispatcher;
pub mod health;
pub mod outbound;
pub mod polls;
pub mod request;
pub mod rooms;
pub mod supervisor;
pub mod sync_loop;
pub mod tasks;
pub mod transport;
pub mod uploads;

#[cfg(test)]
mod test_support;


#[cfg(test)]
mod sync_loop_tests;

#[cfg(test)]
mod transport_tests;
