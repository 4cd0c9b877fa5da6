pub mod containers;
pub mod primitives;
