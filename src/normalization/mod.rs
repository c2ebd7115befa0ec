pub mod fields;
pub mod processor;

pub use fields::FieldMap;
pub use processor::{DataProcessor, FacilityRecord};
