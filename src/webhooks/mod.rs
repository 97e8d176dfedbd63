//! Webhook delivery: event fan-out, payload signing, and the background
//! worker that drains the delivery queue.

pub mod dispatcher;
pub mod signing;
pub mod worker;

pub use worker::DeliveryWorker;
