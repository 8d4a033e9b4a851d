pub mod frequency;
pub mod location;
pub mod records;
