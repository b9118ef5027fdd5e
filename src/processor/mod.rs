pub mod resizer;

pub use resizer::{derive_variants, DerivedVariant, Deriver, ImageResizer, SharedDeriver};
