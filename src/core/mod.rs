//! Core engine logic, independent of the HTTP front end.

pub mod business;
pub mod cache;
pub mod discovery;
pub mod fanout;
pub mod favorites;
pub mod geo;
pub mod listing;
pub mod reservation;
pub mod status;
