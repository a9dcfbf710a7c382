mod mapping;

pub use mapping::{host_to_container, IdMapping, MapOptions};
