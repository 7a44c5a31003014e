pub mod frame;
pub mod value;
