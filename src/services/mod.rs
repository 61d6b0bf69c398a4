pub mod finder;

pub use finder::DuplicateFinder;
