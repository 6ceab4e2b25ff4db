pub mod resolver;

pub use resolver::AccessResolver;
