pub mod booking;
pub mod notify;
pub mod payments;
pub mod policy;
