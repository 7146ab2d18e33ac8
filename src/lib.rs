pub mod config;
pub mod embed;
pub mod error;
pub mod feed;
pub mod indexer;
pub mod invoice;
pub mod keys;
pub mod payment;
pub mod sighash;
pub mod transaction;
pub mod types;

pub use error::AppError;
pub use payment::{PaymentOptions, ProxyPayment};
pub use types::{
    BroadcastResult, DataItem, InputSource, InputSpec, Invoice, OutputSource, OutputSpec, PaymentEvent, PaymentState,
    UnspentOutput,
};
