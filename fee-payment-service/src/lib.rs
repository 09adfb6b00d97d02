//! Fee payment and ledger consistency engine.
//!
//! Takes fee records from outstanding to paid through Razorpay, keeps every
//! record's paid amount equal to its payments minus its refunds, settles the
//! payee's share and reconciles against the provider.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod store;

pub use error::{PaymentError, PaymentResult};
pub use startup::{AppState, Application};
