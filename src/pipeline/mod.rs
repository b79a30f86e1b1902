pub mod spooler;

pub use spooler::{spooler, Batch, SpoolerError, SpoolerReceiver, SpoolerSender};
