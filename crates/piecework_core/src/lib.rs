pub mod bitfield;
pub mod constants;
pub mod error;
pub mod hash_id;
pub mod lengths;
pub mod merkle;
pub mod spawn_utils;
pub mod speed_estimator;

pub use bitfield::BitField;
pub use error::Error;
pub use hash_id::{Id20, Id32};

assert_cfg::exactly_one! {
    feature = "sha1-crypto-hash",
    feature = "sha1-openssl",
}
