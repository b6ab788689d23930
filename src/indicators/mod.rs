pub mod natr;

pub use natr::NatrCalculator;
