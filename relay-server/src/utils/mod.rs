mod api;
mod sleep_handle;

pub use self::api::*;
pub use self::sleep_handle::*;
