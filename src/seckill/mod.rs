//! Seckill Ordering
//!
//! Flash-sale reservation of limited voucher stock: one order per user,
//! stock never below zero, under arbitrary concurrency.
//!
//! - [`VoucherOrderService`] - runs the reservation protocol
//! - [`ReservationOutcome`] / [`Rejection`] - business results as values
//! - [`ReservationTrace`] - step log of each attempt

mod protocol;
mod service;

pub use protocol::{
    Rejection, ReservationOutcome, ReservationState, ReservationStep, ReservationTrace,
};
pub use service::{
    ReservationStats, ReservationStatsSnapshot, SeckillConfig, VoucherOrderService,
};
