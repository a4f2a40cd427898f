pub mod error;
pub mod result_code;

pub use error::{DbError, ErrorKind, Result};
pub use result_code::ResultCode;
