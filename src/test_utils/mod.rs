//! the test_utils folder here will share utils or test components between unit
//! tests
mod common;
mod mock_transport;

pub(crate) use common::*;
pub use mock_transport::*;
