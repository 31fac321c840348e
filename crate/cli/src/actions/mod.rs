pub mod info;
pub mod random;
