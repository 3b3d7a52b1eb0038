mod error;

pub use error::{err, invariant_err, transport_err, Error, Kind, Result};
