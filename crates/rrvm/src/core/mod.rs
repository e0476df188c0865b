mod types;
mod word;

pub use types::TypeTag;
pub use word::{Word, f32_from_word, f32_to_word, f64_from_word, f64_to_word};
