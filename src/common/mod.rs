//! Core types shared by every layer

mod stream;
mod target;

pub use stream::{IntoStream, Stream};
pub use target::Target;

pub use crate::error::{Error, Result};
