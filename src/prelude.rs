pub use salvo::oapi::{ToSchema, endpoint};
pub use salvo::prelude::*;
pub use serde::{Deserialize, Serialize};

pub use crate::error::BrokerError;

pub type AppResult<T> = Result<T, BrokerError>;
