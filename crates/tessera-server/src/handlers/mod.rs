pub mod collections;
pub mod sketches;
