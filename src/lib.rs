pub mod builders;
pub mod common;
pub mod hlo;
pub mod literal;
pub mod pass;
pub mod pprint;
pub mod shape_inference;
pub mod space_to_batch;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
pub mod window;
